use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use xiaozhi_gateway::adapters::http::HttpSseAdapter;
use xiaozhi_gateway::adapters::stdio::StdioAdapter;
use xiaozhi_gateway::adapters::TransportAdapter;
use xiaozhi_gateway::cache::CacheStore;
use xiaozhi_gateway::config::{self, ConfigStore};
use xiaozhi_gateway::events::{EventBus, GatewayEvent};
use xiaozhi_gateway::handler::MessageHandler;
use xiaozhi_gateway::hub::HubConnectionManager;
use xiaozhi_gateway::manager::ServiceManager;
use xiaozhi_gateway::registry::ToolRegistry;

#[derive(Parser)]
#[command(name = "xiaozhi-gateway", version, about = "Multiplexing MCP gateway")]
struct Cli {
    /// Configuration directory (overrides XIAOZHI_CONFIG_DIR).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (the default).
    Start {
        /// Also serve MCP on this process's stdin/stdout.
        #[arg(long)]
        stdio: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr: stdout may carry the stdio MCP protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let stdio = match cli.command {
        Some(Command::Start { stdio }) => stdio,
        None => false,
    };

    let dir = cli.config_dir.unwrap_or_else(config::config_dir);
    tracing::info!("using configuration directory {}", dir.display());

    let config = ConfigStore::load_from_dir(&dir)?;
    let cache = CacheStore::load_from_dir(&dir);
    let events = EventBus::new();
    let registry = ToolRegistry::new(config.clone());
    let manager = ServiceManager::new(config.clone(), registry, cache.clone(), events.clone());
    let handler = MessageHandler::new(manager.clone());

    let sweeper = cache.spawn_sweeper();
    manager.start_all().await;

    // Hub sessions mirror the registry; re-push on every tool change.
    let hub = HubConnectionManager::new(
        handler.clone(),
        manager.clone(),
        config.hub_options(),
        events.clone(),
    );
    hub.initialize(&config.mcp_endpoints())?;
    {
        let hub = hub.clone();
        events.subscribe(move |event, _| {
            if matches!(event, GatewayEvent::ServerToolsUpdated { .. }) {
                let hub = hub.clone();
                tokio::spawn(async move { hub.sync_tools().await });
            }
        });
    }
    hub.connect().await;

    let http = Arc::new(HttpSseAdapter::new(
        handler.clone(),
        config.gateway_settings(),
    ));
    http.start().await?;

    let stdio_adapter = if stdio {
        let adapter = Arc::new(StdioAdapter::new(handler.clone()));
        adapter.start().await?;
        Some(adapter)
    } else {
        None
    };

    tracing::info!("gateway up; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    if let Some(adapter) = stdio_adapter {
        adapter.stop().await.ok();
    }
    http.stop().await.ok();
    hub.disconnect().await;
    manager.stop_all().await;
    sweeper.abort();
    Ok(())
}
