use anyhow::{Context, Result};
use courier_backend::config::CourierConfig;
use courier_backend::runtime::CourierRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_backend=debug")),
        )
        .init();

    let config = CourierConfig::load();
    if let Err(missing) = config.ensure_credentials() {
        tracing::error!("{}; refusing to start", missing);
        return Err(missing.into());
    }

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    let runtime = CourierRuntime::bootstrap(config).context("failed to bootstrap courier runtime")?;

    tracing::info!(
        "Starting courier backend (admin API on {}, set COURIER_ADMIN_BIND to change)",
        runtime.config.admin_bind
    );

    server_rt.block_on(runtime.run())
}
