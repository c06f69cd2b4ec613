use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ace_gateway::config::GatewayConfig;
use ace_gateway::plugin::playlist::PlaylistPlugin;
use ace_gateway::plugin::PluginRegistry;
use ace_gateway::relay::{
    ChannelDirectory, EngineRegistry, HttpChannelDirectory, RelayOrchestrator, TcpEngineConnector,
};
use ace_gateway::server::{AppState, GatewayServer};
use ace_gateway::source::http_source::HttpSource;

#[derive(Parser, Debug)]
#[command(name = "ace-gateway", version, about = "HTTP gateway for a P2P streaming engine")]
struct Args {
    /// JSON configuration file; missing fields keep their defaults.
    #[arg(long, env = "ACE_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ACE_GATEWAY_HTTP_HOST")]
    http_host: Option<String>,

    #[arg(long, env = "ACE_GATEWAY_HTTP_PORT")]
    http_port: Option<u16>,

    #[arg(long, env = "ACE_GATEWAY_ENGINE_HOST")]
    engine_host: Option<String>,

    #[arg(long, env = "ACE_GATEWAY_ENGINE_PORT")]
    engine_port: Option<u16>,

    #[arg(long, env = "ACE_GATEWAY_PRODUCT_KEY")]
    product_key: Option<String>,
}

impl Args {
    fn load_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => GatewayConfig::default(),
        };

        if let Some(host) = &self.http_host {
            config.http_host = host.clone();
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(host) = &self.engine_host {
            config.engine.host = host.clone();
        }
        if let Some(port) = self.engine_port {
            config.engine.port = port;
        }
        if let Some(key) = &self.product_key {
            config.engine.product_key = key.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ace_gateway::init_tracing();

    let args = Args::parse();
    let config = Arc::new(args.load_config()?);

    let directory = config
        .cybertv
        .as_ref()
        .map(|c| Arc::new(HttpChannelDirectory::new(c.clone(), config.http_port)));

    let mut orchestrator = RelayOrchestrator::new(
        Arc::clone(&config),
        Arc::new(EngineRegistry::new()),
        Arc::new(TcpEngineConnector::from_config(&config.engine)),
        Arc::new(HttpSource::new()),
    );
    if let Some(directory) = &directory {
        orchestrator = orchestrator.with_channel_directory(directory.clone());
    }
    let orchestrator = Arc::new(orchestrator);

    let mut plugins = PluginRegistry::new();
    if let Some(playlist) = &config.playlist {
        plugins.register(Arc::new(PlaylistPlugin::new(playlist.clone())));
    }

    let server = GatewayServer::start(
        &config.bind_addr(),
        AppState {
            orchestrator,
            plugins: Arc::new(plugins),
        },
    )
    .await?;
    info!(
        "engine at {}, serving on port {}",
        config.engine.addr(),
        server.port()
    );

    if let Some(directory) = &directory {
        if let Err(e) = directory.server_active(true).await {
            warn!("channel directory registration failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(directory) = &directory {
        if let Err(e) = directory.server_active(false).await {
            warn!("channel directory deregistration failed: {}", e);
        }
    }
    server.shutdown();
    Ok(())
}
