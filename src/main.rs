#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use fleet_telemetry::fleet::config::resolve_hosts_file;
use fleet_telemetry::fleet::hosts::InMemoryHostStore;
use fleet_telemetry::fleet::{FleetMonitor, FleetTools};
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    // Host inventory and the shared monitor
    let hosts = Arc::new(InMemoryHostStore::load(&resolve_hosts_file(None))?);
    let monitor = Arc::new(FleetMonitor::from_env(hosts));
    monitor.start();

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools_monitor = Arc::clone(&monitor);
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(FleetTools::new(Arc::clone(&tools_monitor)))
            }),
        )
        .with(Tracing);

    info!("MCP Server with fleet telemetry is ready");
    info!("Use the fleet_overview command to see every host");

    // Run the MCP server
    Server::new(TcpListener::bind(mcp_addr))
        .name("Fleet Telemetry MCP Server")
        .run(app)
        .await?;

    monitor.stop();
    Ok(())
}
