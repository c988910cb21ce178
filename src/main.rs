//! Server binary: CLI parsing, logging, wiring, stdio serve.

use ado_mcp::ado::AdoClient;
use ado_mcp::auth::AzCliTokenProvider;
use ado_mcp::server::WorkItemMcpServer;
use ado_mcp::toolset::{AppState, build_registry};
use ado_mcp::{AdoGateway, ServerConfig, TokenProvider};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// MCP server for Azure DevOps work-item management.
#[derive(Debug, Parser)]
#[command(name = "ado-workitem-mcp", version, about)]
struct Cli {
    /// Azure DevOps organization name (https://dev.azure.com/{organization})
    organization: String,

    /// Area path to scope operations to. Repeatable; the first segment of
    /// the first path names the project.
    #[arg(long = "area-path", required = true)]
    area_path: Vec<String>,

    /// GUID of the GitHub Copilot service account, used to classify its
    /// edits as automation in staleness analysis.
    #[arg(long = "copilot-guid")]
    copilot_guid: Option<String>,
}

/// How often expired query handles are swept.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP protocol; all logs go to stderr.
    let default_filter = if std::env::var("MCP_DEBUG").is_ok_and(|v| v == "1") {
        "ado_mcp=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut builder = ServerConfig::builder().organization(&cli.organization);
    for path in &cli.area_path {
        builder = builder.area_path(path);
    }
    if let Some(guid) = &cli.copilot_guid {
        builder = builder.copilot_guid(guid);
    }
    let config = Arc::new(builder.build().context("invalid configuration")?);

    tracing::info!(
        organization = %config.organization,
        project = %config.project,
        area_paths = config.area_paths.len(),
        "starting ado-workitem-mcp"
    );

    let provider: Arc<dyn TokenProvider> = Arc::new(AzCliTokenProvider::new());
    let gateway: Arc<dyn AdoGateway> = Arc::new(
        AdoClient::new(Arc::clone(&config), Arc::clone(&provider))
            .context("failed to build ADO client")?,
    );

    let state = Arc::new(AppState::new(Arc::clone(&config), gateway));
    let registry = Arc::new(
        build_registry(Arc::clone(&state), Some(provider))
            .context("failed to build tool registry")?,
    );

    // Periodic sweep of expired handles; reads are lazily checked anyway,
    // this just reclaims memory.
    let store = Arc::clone(&state.store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        loop {
            ticker.tick().await;
            let reclaimed = store.purge_expired();
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "purged expired query handles");
            }
        }
    });

    let server = WorkItemMcpServer::new(registry, "ado-workitem-mcp", env!("CARGO_PKG_VERSION"));
    server.serve_stdio().await.context("MCP server failed")?;

    tracing::info!("client disconnected, shutting down");
    Ok(())
}
