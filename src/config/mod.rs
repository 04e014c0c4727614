//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use feedsync_api_types::{ANONYMOUS_VIEWER, GLOBAL_FEED_ID};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    ClientOverrides, CliArgs, Command, LoggingOverrides, ServeArgs, ServeOverrides, SubmitArgs,
    WatchArgs,
};

use crate::application::listener::{ListenerOptions, ReconnectPolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedsync";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RECENT_EVENT_LIMIT: usize = 50;
const DEFAULT_STATE_MACHINE: &str = "save-post";
const DEFAULT_MODERATION_DELAY_MS: u64 = 1_500;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub listener: ListenerSettings,
    pub workflow: WorkflowSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Where the client-side commands find the backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub viewer_id: String,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_max_attempts: u32,
    pub recent_event_limit: NonZeroUsize,
}

impl ListenerSettings {
    pub fn options(&self) -> ListenerOptions {
        ListenerOptions {
            reconnect: ReconnectPolicy {
                initial_backoff: self.reconnect_initial_backoff,
                max_backoff: self.reconnect_max_backoff,
                max_attempts: self.reconnect_max_attempts,
            },
            recent_event_limit: self.recent_event_limit.get(),
        }
    }
}

/// Settings of the in-process save-post workflow served by `serve`.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub state_machine: String,
    pub moderation_delay: Duration,
    pub default_feed: String,
    /// Captions containing any of these (case-insensitive) are rejected.
    pub blocked_terms: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FEEDSYNC").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Submit(args)) => raw.apply_client_overrides(&args.client),
        Some(Command::Watch(args)) => raw.apply_client_overrides(&args.client),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    listener: RawListenerSettings,
    workflow: RawWorkflowSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(delay) = overrides.workflow_moderation_delay_ms {
            self.workflow.moderation_delay_ms = Some(delay);
        }
    }

    fn apply_client_overrides(&mut self, overrides: &ClientOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.base_url = Some(url.clone());
        }
        if let Some(viewer) = overrides.viewer_id.as_ref() {
            self.backend.viewer_id = Some(viewer.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.backend.request_timeout_seconds = Some(seconds);
        }
        if let Some(attempts) = overrides.listener_max_attempts {
            self.listener.reconnect_max_attempts = Some(attempts);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            backend,
            listener,
            workflow,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            backend: build_backend_settings(backend)?,
            listener: build_listener_settings(listener)?,
            workflow: build_workflow_settings(workflow)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let raw_url = backend
        .base_url
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("backend.base_url", format!("invalid url: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "backend.base_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = backend
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "backend.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let viewer_id = non_blank(backend.viewer_id, ANONYMOUS_VIEWER, "backend.viewer_id")?;

    Ok(BackendSettings {
        base_url,
        request_timeout: Duration::from_secs(timeout_secs),
        viewer_id,
    })
}

fn build_listener_settings(listener: RawListenerSettings) -> Result<ListenerSettings, LoadError> {
    let initial_ms = listener
        .reconnect_initial_backoff_ms
        .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS);
    let max_ms = listener
        .reconnect_max_backoff_ms
        .unwrap_or(DEFAULT_RECONNECT_MAX_MS);
    let max_attempts = listener
        .reconnect_max_attempts
        .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS);

    if max_attempts > 0 && initial_ms == 0 {
        return Err(LoadError::invalid(
            "listener.reconnect_initial_backoff_ms",
            "must be greater than zero when reconnecting is enabled",
        ));
    }
    if max_ms < initial_ms {
        return Err(LoadError::invalid(
            "listener.reconnect_max_backoff_ms",
            "must not be smaller than the initial backoff",
        ));
    }

    let recent_event_limit = NonZeroUsize::new(
        listener
            .recent_event_limit
            .unwrap_or(DEFAULT_RECENT_EVENT_LIMIT),
    )
    .ok_or_else(|| LoadError::invalid("listener.recent_event_limit", "must be greater than zero"))?;

    Ok(ListenerSettings {
        reconnect_initial_backoff: Duration::from_millis(initial_ms),
        reconnect_max_backoff: Duration::from_millis(max_ms),
        reconnect_max_attempts: max_attempts,
        recent_event_limit,
    })
}

fn build_workflow_settings(workflow: RawWorkflowSettings) -> Result<WorkflowSettings, LoadError> {
    let state_machine = non_blank(
        workflow.state_machine,
        DEFAULT_STATE_MACHINE,
        "workflow.state_machine",
    )?;
    let default_feed = non_blank(workflow.default_feed, GLOBAL_FEED_ID, "workflow.default_feed")?;
    let moderation_delay = Duration::from_millis(
        workflow
            .moderation_delay_ms
            .unwrap_or(DEFAULT_MODERATION_DELAY_MS),
    );
    let blocked_terms = workflow
        .blocked_terms
        .unwrap_or_default()
        .into_iter()
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect();

    Ok(WorkflowSettings {
        state_machine,
        moderation_delay,
        default_feed,
        blocked_terms,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
    viewer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawListenerSettings {
    reconnect_initial_backoff_ms: Option<u64>,
    reconnect_max_backoff_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    recent_event_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkflowSettings {
    state_machine: Option<String>,
    moderation_delay_ms: Option<u64>,
    default_feed: Option<String>,
    blocked_terms: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    match value {
        None => Ok(default.to_string()),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(LoadError::invalid(key, "must not be empty"))
            } else {
                Ok(trimmed.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests;
