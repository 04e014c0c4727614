use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "feedsync_submissions_total",
            Unit::Count,
            "Post submissions by outcome (accepted, failed, invalid)."
        );
        describe_counter!(
            "feedsync_rollbacks_total",
            Unit::Count,
            "Placeholders removed after a failed workflow trigger."
        );
        describe_counter!(
            "feedsync_feed_events_total",
            Unit::Count,
            "Feed events received by the listener, by event type."
        );
        describe_counter!(
            "feedsync_listener_reconnects_total",
            Unit::Count,
            "Reconnect attempts made by the event listener."
        );
        describe_counter!(
            "feedsync_workflow_executions_total",
            Unit::Count,
            "Save-post workflow executions started."
        );
    });
}
