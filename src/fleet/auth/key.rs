//! Private key SSH authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::fleet::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Where the private key material comes from.
enum KeySource {
    File(PathBuf),
    /// PEM/OpenSSH text held by the credential store
    Inline(String),
}

/// Private key authentication strategy.
///
/// Supports key files and inline PEM text, with an optional passphrase.
pub struct KeyAuth {
    source: KeySource,
    passphrase: Option<String>,
}

impl KeyAuth {
    /// Key loaded from a file on the local filesystem.
    pub fn from_file(key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            source: KeySource::File(key_path.into()),
            passphrase,
        }
    }

    /// Key decoded from in-memory PEM text.
    pub fn from_pem(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            source: KeySource::Inline(pem.into()),
            passphrase,
        }
    }

    fn load(&self) -> Result<keys::PrivateKey, String> {
        let passphrase = self.passphrase.as_deref();
        match &self.source {
            KeySource::File(path) => keys::load_secret_key(path, passphrase)
                .map_err(|e| format!("Failed to load private key from {:?}: {}", path, e)),
            KeySource::Inline(pem) => keys::decode_secret_key(pem, passphrase)
                .map_err(|e| format!("Failed to decode private key: {}", e)),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = self.load()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
