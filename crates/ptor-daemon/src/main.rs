//! ptor-relay daemon: runs one relay until Ctrl-C.

mod config;

use std::sync::Arc;

use tracing::{error, info};

use ptor_relay::server::RelayServer;

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("ptor={}", config.logging.level).parse()?),
        )
        .init();

    info!(path = ?DaemonConfig::config_path(), "ptor relay starting");

    let server = Arc::new(RelayServer::bind(config.relay_config()).await?);
    info!(addr = %server.local_addr()?, "relay ready");

    let runner = Arc::clone(&server);
    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!(error = %e, "relay server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    server.shutdown();
    info!("relay stopped");
    Ok(())
}
