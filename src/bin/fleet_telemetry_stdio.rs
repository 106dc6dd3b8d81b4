#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use fleet_telemetry::fleet::config::resolve_hosts_file;
use fleet_telemetry::fleet::hosts::InMemoryHostStore;
use fleet_telemetry::fleet::{FleetMonitor, FleetTools};
use poem_mcpserver::McpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hosts = Arc::new(InMemoryHostStore::load(&resolve_hosts_file(None))?);
    let monitor = Arc::new(FleetMonitor::from_env(hosts));
    monitor.start();

    poem_mcpserver::stdio::stdio(McpServer::new().tools(FleetTools::new(Arc::clone(&monitor))))
        .await?;

    monitor.stop();
    Ok(())
}
