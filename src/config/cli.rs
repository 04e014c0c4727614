use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the feedsync binary.
#[derive(Debug, Parser)]
#[command(
    name = "feedsync",
    version,
    about = "Optimistic post submission and live feed synchronisation"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the in-memory feed backend over HTTP.
    Serve(Box<ServeArgs>),
    /// Submit a post and print the reconciled feed.
    Submit(SubmitArgs),
    /// Follow a feed and log every applied event until interrupted.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override how long the stand-in moderation workflow takes to decide.
    #[arg(long = "workflow-moderation-delay-ms", value_name = "MILLIS")]
    pub workflow_moderation_delay_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClientOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the backend base URL.
    #[arg(long = "backend-url", env = "FEEDSYNC_BACKEND_URL", value_name = "URL")]
    pub backend_url: Option<String>,

    /// Override the viewer identity sent with every request.
    #[arg(long = "viewer", value_name = "ID")]
    pub viewer_id: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "backend-timeout-seconds", value_name = "SECONDS")]
    pub request_timeout_seconds: Option<u64>,

    /// Override how many times the listener reconnects (0 disables).
    #[arg(long = "listener-max-attempts", value_name = "COUNT")]
    pub listener_max_attempts: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub client: ClientOverrides,

    /// Caption of the new post.
    #[arg(long)]
    pub caption: String,

    /// Public URL of the uploaded photo.
    #[arg(long = "photo-url", value_name = "URL")]
    pub photo_url: String,

    /// Storage key of the uploaded photo.
    #[arg(long = "photo-key", value_name = "KEY")]
    pub photo_key: String,

    /// Feed to post into; defaults to the configured feed.
    #[arg(long = "feed", value_name = "FEED")]
    pub feed: Option<String>,

    /// How long to wait for the moderation decision (0 skips waiting).
    #[arg(long = "wait-seconds", value_name = "SECONDS", default_value_t = 10)]
    pub wait_seconds: u64,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub client: ClientOverrides,

    /// Feed to follow; defaults to the configured feed.
    #[arg(long = "feed", value_name = "FEED")]
    pub feed: Option<String>,
}
