//! Authentication strategies for fleet SSH sessions.
//!
//! Strategies implement [`AuthStrategy`] and are combined into an
//! [`AuthChain`] built from a host's [`Credentials`].
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key authentication, from a file or an inline PEM
//! - [`AgentAuth`]: SSH agent authentication
//!
//! [`Credentials`]: crate::fleet::hosts::Credentials

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
