//! Output parsers and the fan-out queries that feed them.
//!
//! The vendor `npu-smi` tool and standard Linux utilities print text meant
//! for humans. The parsers turn that text into the typed snapshots in
//! [`crate::fleet::types`]; the collectors decide which commands to run and
//! run them concurrently through a [`CommandRunner`].

pub mod accelerator;
pub mod fanout;
pub mod processes;
pub mod retry;
pub(crate) mod rules;
pub mod system;

pub use fanout::collect_accelerator_snapshot;
pub use retry::{CommandRunner, run_with_retry};
pub use system::collect_system_snapshot;
