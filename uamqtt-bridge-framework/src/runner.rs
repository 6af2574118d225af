//! Bridge runner for lifecycle management.

use std::future::Future;

use tokio::signal;
use tokio_util::sync::CancellationToken;

use uamqtt_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;

/// Convenience function to run a bridge with minimal boilerplate.
///
/// This will:
/// 1. Parse CLI arguments and load the configuration
/// 2. Initialize logging (with optional CLI level override)
/// 3. Install Ctrl+C / SIGTERM handlers that cancel the shutdown token
/// 4. Run the bridge body until it returns
///
/// # Example
///
/// ```ignore
/// use uamqtt_bridge_framework::run_bridge;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_bridge::<MyBridgeConfig, _, _>("mybridge", "mybridge.json5", |config, shutdown| async move {
///         my_bridge(config).run(shutdown).await
///     })
///     .await
/// }
/// ```
pub async fn run_bridge<C, F, Fut>(
    name: &str,
    default_config: &'static str,
    body: F,
) -> anyhow::Result<()>
where
    C: BridgeConfig,
    F: FnOnce(C, CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let args = BridgeArgs::parse_with_default(default_config);
    let config = C::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let log_config = logging_with_override(config.logging(), args.log_level.as_deref());
    init_tracing(&log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!(
        bridge = %name,
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting bridge"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = body(config, shutdown).await;

    match &result {
        Ok(()) => tracing::info!(bridge = %name, "Goodbye!"),
        Err(e) => tracing::error!(bridge = %name, error = %e, "Bridge stopped with error"),
    }

    result
}

/// Apply the `--log-level` override to the configured logging settings.
fn logging_with_override(config: &LoggingConfig, level: Option<&str>) -> LoggingConfig {
    let mut log_config = config.clone();
    if let Some(level) = level {
        log_config.level = level.to_string();
    }
    log_config
}

/// Cancel the token on Ctrl+C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                wait_ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = wait_ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    wait_ctrl_c().await;

    tracing::info!("Received shutdown signal");
    shutdown.cancel();
}

async fn wait_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
