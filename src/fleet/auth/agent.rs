//! SSH agent authentication.
//!
//! Used for hosts whose inventory entry says `agent`, and as the fallback
//! after key credentials.

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use crate::fleet::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Offers every identity held by the agent at `SSH_AUTH_SOCK`.
#[derive(Default)]
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("SSH agent unreachable: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("SSH agent refused to list identities: {}", e))?;
        if identities.is_empty() {
            return Err("SSH agent holds no identities".to_string());
        }

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let offered = identities.len();
        for (index, identity) in identities.into_iter().enumerate() {
            match handle
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!(
                        "Authenticated {} with agent identity {}/{}",
                        username,
                        index + 1,
                        offered
                    );
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity {}/{} rejected", index + 1, offered),
                Err(e) => debug!("Agent identity {}/{} failed: {}", index + 1, offered, e),
            }
        }

        // Every identity was offered and none accepted
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
