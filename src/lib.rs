//! Accelerator fleet telemetry and SSH session orchestration, served over MCP.

pub mod fleet;
