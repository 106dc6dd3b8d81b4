//! Password authentication for inventory entries with `type: password` and
//! for connect-time password overrides.

use async_trait::async_trait;
use russh::client;

use crate::fleet::session::SshClientHandler;

use super::traits::AuthStrategy;

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        // Empty passwords are never sent
        if self.password.is_empty() {
            return Ok(false);
        }
        handle
            .authenticate_password(username, &self.password)
            .await
            .map(|result| result.success())
            .map_err(|e| format!("Password authentication failed for {}: {}", username, e))
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
