use anyhow::{Context, Result};
use flume::unbounded;
use persona_backend::config::AgentConfig;
use persona_backend::runtime::BackendRuntime;
use persona_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,persona_backend=debug")),
        )
        .init();

    let config = AgentConfig::load();
    if !config.persistence_configured() {
        tracing::warn!(
            "PERSONA_KV_URL / PERSONA_KV_TOKEN unset; state will not survive a restart"
        );
    }
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting persona backend service (set PERSONA_BACKEND_TOKEN + optional PERSONA_BACKEND_BIND; auth mode via PERSONA_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async {
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
