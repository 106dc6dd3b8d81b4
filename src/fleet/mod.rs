//! Accelerator fleet telemetry over SSH.
//!
//! This module is organized into the following submodules:
//!
//! - `hosts`: Host inventory and credentials
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error type and classification
//! - `auth`, `client`, `session`: russh connection and authentication plumbing
//! - `storage`: Session and shell storage behind traits
//! - `registry`: One authenticated session per host
//! - `parsers`: `npu-smi` and Linux tool output parsers plus their collectors
//! - `store`: Latest-snapshot cache and history tables
//! - `scheduler`: Per-host refresh lifecycles with reconnect backoff
//! - `shell`: Interactive PTY sessions
//! - `transfer`: Remote file operations over exec channels
//! - `monitor`: Facade wiring the components together
//! - `commands`: MCP tool implementations

pub mod auth;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod hosts;
pub mod monitor;
pub mod parsers;
pub mod registry;
pub(crate) mod schema;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod storage;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;
pub mod types;

pub use commands::FleetTools;
pub use error::FleetError;
pub use monitor::FleetMonitor;
