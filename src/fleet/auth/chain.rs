//! Authentication chain for trying multiple strategies.

use std::path::PathBuf;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::fleet::hosts::Credentials;
use crate::fleet::session::SshClientHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// The first successful strategy stops the chain.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for a host's credentials.
    ///
    /// Explicit credentials are tried first. Key-based credentials fall back
    /// to the SSH agent.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        match credentials {
            Credentials::Password { password } => Self::new().with_password(password.clone()),
            Credentials::PrivateKey { pem, passphrase } => Self::new()
                .with_pem(pem.clone(), passphrase.clone())
                .with_agent(),
            Credentials::KeyFile { path, passphrase } => Self::new()
                .with_key(path.clone(), passphrase.clone())
                .with_agent(),
            Credentials::Agent => Self::new().with_agent(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.strategies
            .push(Box::new(KeyAuth::from_file(key_path, passphrase)));
        self
    }

    pub fn with_pem(mut self, pem: impl Into<String>, passphrase: Option<String>) -> Self {
        self.strategies
            .push(Box::new(KeyAuth::from_pem(pem, passphrase)));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(chain: &AuthChain) -> Vec<&'static str> {
        chain.strategies.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_auth_chain_empty() {
        let chain = AuthChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert_eq!(chain.name(), "chain");
    }

    #[test]
    fn test_fluent_api_preserves_order() {
        let chain = AuthChain::new()
            .with_password("pass1")
            .with_key("/key1", None)
            .with_pem("pem", None)
            .with_agent();
        assert_eq!(names(&chain), vec!["password", "key", "key", "agent"]);
    }

    mod from_credentials {
        use super::*;

        #[test]
        fn test_password_only() {
            let chain = AuthChain::from_credentials(&Credentials::Password {
                password: "x".into(),
            });
            assert_eq!(names(&chain), vec!["password"]);
        }

        #[test]
        fn test_inline_key_falls_back_to_agent() {
            let chain = AuthChain::from_credentials(&Credentials::PrivateKey {
                pem: "pem".into(),
                passphrase: None,
            });
            assert_eq!(names(&chain), vec!["key", "agent"]);
        }

        #[test]
        fn test_key_file_falls_back_to_agent() {
            let chain = AuthChain::from_credentials(&Credentials::KeyFile {
                path: "/k".into(),
                passphrase: Some("pw".into()),
            });
            assert_eq!(names(&chain), vec!["key", "agent"]);
        }

        #[test]
        fn test_agent_only() {
            let chain = AuthChain::from_credentials(&Credentials::Agent);
            assert_eq!(names(&chain), vec!["agent"]);
        }
    }

    #[test]
    fn test_auth_chain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthChain>();
    }
}
