//! Builds a running transport from the reporter configuration.

use crate::{Config, CoreResult, Paths};
use event_transport::{
    DrainPolicy, HttpSender, HttpSenderConfig, RetryPolicy, TransportConfig,
    TransportCoordinator, TransportOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Map the file configuration onto transport options.
pub fn transport_options(config: &Config) -> TransportOptions {
    TransportOptions {
        config: TransportConfig {
            sample_rate: config.sample_rate,
            max_events: config.max_events,
            max_breadcrumbs: config.max_breadcrumbs,
        },
        max_concurrent_attempts: config.max_concurrent_attempts,
        hook_timeout: Duration::from_millis(config.hook_timeout_ms),
        retry: RetryPolicy {
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        },
        drain: DrainPolicy {
            interval: config.drain_interval_secs.map(Duration::from_secs),
            on_start: config.drain_on_start,
            after_success: config.drain_after_success,
        },
        ..Default::default()
    }
}

/// Start a transport that POSTs to the configured endpoint and stores events
/// under the outbox directory.
///
/// Must be called from within a tokio runtime.
pub fn start_transport(config: &Config, paths: &Paths) -> CoreResult<TransportCoordinator> {
    let endpoint = config.endpoint_url()?;
    paths.ensure_dirs()?;

    let sender = HttpSender::new(HttpSenderConfig {
        endpoint: endpoint.to_string(),
        auth_token: config.auth_token.clone(),
        timeout_secs: config.request_timeout_secs,
        ..Default::default()
    })?;

    let transport = TransportCoordinator::start(
        transport_options(config),
        paths.outbox_dir(),
        Arc::new(sender),
    )?;

    info!(
        endpoint = %endpoint,
        outbox = %paths.outbox_dir().display(),
        "Crash reporter transport started"
    );
    Ok(transport)
}
