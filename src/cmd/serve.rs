//! Build API server command: `bskit serve`.

use anyhow::Result;

use bskit::config::BskitToml;
use bskit::server::{ServerConfig, start_server};
use bskit::service::BuildService;

pub async fn cmd_serve(
    config: &BskitToml,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    let service = BuildService::from_config(config)?;

    start_server(
        service,
        ServerConfig {
            host: host.unwrap_or_else(|| config.server.host.clone()),
            port: port.unwrap_or(config.server.port),
            dev_mode: dev,
        },
    )
    .await
}
