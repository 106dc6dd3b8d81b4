//! russh client handler shared by every registry session.
//!
//! `SshClientHandler` accepts all server host keys, similar to
//! `StrictHostKeyChecking=no` in OpenSSH. Fleet hosts are addressed from an
//! operator-maintained inventory; host key pinning would hook in here.
//!
//! The `client::Handle<SshClientHandler>` is not `Clone`, so the registry keeps
//! it behind an `Arc` to share one session between the scheduler, the shell
//! bridge and the transfer gateway.

use russh::{client, keys};

/// Client handler for russh that accepts all host keys.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
