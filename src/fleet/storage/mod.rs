//! Storage abstractions for registry sessions and interactive shells.
//!
//! Trait-based so components receive storage by injection and tests can run
//! without a live SSH server. The default implementations use `DashMap`.

mod session;
mod shell;
mod traits;

pub use session::DashMapSessionStorage;
pub use shell::DashMapShellStorage;
pub use traits::{SessionRef, SessionStorage, ShellStorage, StoredSession};
