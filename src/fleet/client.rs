//! SSH connection, command execution and PTY plumbing.
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: `host:port`, `host`, or an IPv6 literal, with
//!    default port 22.
//! 2. **Client Configuration**: keepalive and compression, no inactivity
//!    timeout for long-lived registry sessions.
//! 3. **Connection Establishment**: TCP + SSH handshake.
//! 4. **Authentication**: an [`AuthChain`] built from the host's credentials.
//!
//! Steps 3 and 4 share the connect timeout. Each remote command runs under
//! one deadline from channel open to exit status.
//!
//! Every failure is mapped onto a [`FleetError`] here so that callers never
//! inspect message text. No retries happen at this layer.

use std::sync::Arc;
use std::time::Duration;

use russh::{ChannelMsg, client};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fleet::auth::{AuthChain, AuthStrategy};
use crate::fleet::error::{FleetError, classify_connect_error};
use crate::fleet::hosts::{Credentials, Host};
use crate::fleet::registry::{PtySize, ShellChannel, ShellCommand};
use crate::fleet::session::SshClientHandler;
use crate::fleet::types::CommandOutput;

/// Terminal type requested for interactive shells.
pub(crate) const TERM: &str = "xterm-256color";

const SHELL_CHANNEL_CAPACITY: usize = 256;

/// Build russh client configuration.
///
/// Registry sessions live until disconnected or evicted, so there is no
/// inactivity timeout; keepalives detect dead peers instead.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse `host:port`, `host`, `[v6]:port`, `[v6]` or a bare IPv6 literal.
///
/// The port defaults to 22. Brackets are stripped from IPv6 literals.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), FleetError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|e| FleetError::Validation(format!("Invalid port number: {}", e)))
    };

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            FleetError::Validation(format!("Unterminated IPv6 literal: {}", address))
        })?;
        let port = match tail {
            "" => 22,
            _ => match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => {
                    return Err(FleetError::Validation(format!(
                        "Invalid address: {}",
                        address
                    )));
                }
            },
        };
        return Ok((host.to_string(), port));
    }

    // More than one colon without brackets can only be a bare IPv6 literal
    if address.matches(':').count() > 1 {
        return Ok((address.to_string(), 22));
    }

    match address.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((address.to_string(), 22)),
    }
}

/// Run `future` under `timeout`; expiry is a [`FleetError::Command`].
pub(crate) async fn with_deadline<T>(
    timeout: Duration,
    what: &str,
    future: impl Future<Output = Result<T, FleetError>>,
) -> Result<T, FleetError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} timed out after {:?}", what, timeout);
            Err(FleetError::Command(format!(
                "{} timed out after {:?}",
                what, timeout
            )))
        }
    }
}

/// Establish an authenticated session to `host`.
///
/// `credentials` replaces the host's stored credentials when given. The TCP
/// connect, the SSH handshake and authentication share one `timeout`.
pub(crate) async fn connect_to_ssh(
    host: &Host,
    credentials: Option<&Credentials>,
    timeout: Duration,
    compress: bool,
) -> Result<client::Handle<SshClientHandler>, FleetError> {
    let config = build_client_config(compress);
    let (address, port) = parse_address(&host.address)?;
    let auth_chain = AuthChain::from_credentials(credentials.unwrap_or(&host.credentials));

    let establish = async {
        let mut handle = client::connect(config, (address.as_str(), port), SshClientHandler)
            .await
            .map_err(|e| classify_connect_error(format!("Failed to connect: {}", e)))?;

        let success = auth_chain
            .authenticate(&mut handle, &host.username)
            .await
            .map_err(classify_connect_error)?;

        if !success {
            return Err(FleetError::Authentication(
                "no authentication methods succeeded".to_string(),
            ));
        }
        Ok(handle)
    };

    tokio::time::timeout(timeout, establish)
        .await
        .map_err(|_| FleetError::Connection(format!("Connection timed out after {:?}", timeout)))?
}

/// Run one command on a fresh exec channel and collect its output.
///
/// A non-zero exit code is returned as data. Opening the channel, starting
/// the command and reading its output all count against `timeout`; expiry is
/// a [`FleetError::Command`] and the session stays usable.
/// Exit code is -1 when the server never reports one.
pub(crate) async fn execute_ssh_command(
    handle: &client::Handle<SshClientHandler>,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, FleetError> {
    with_deadline(timeout, "command", run_command(handle, command)).await
}

async fn run_command(
    handle: &client::Handle<SshClientHandler>,
    command: &str,
) -> Result<CommandOutput, FleetError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FleetError::Command(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| FleetError::Command(format!("Failed to execute command: {}", e)))?;

    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_code: Option<u32> = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            // ext == 1 is stderr in SSH protocol
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::Eof) => {
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
    })
}

/// Open a PTY-backed login shell and hand it to a pump task.
///
/// The returned [`ShellChannel`] is transport-agnostic: input, resize and
/// close go through `input`; remote output (stdout and stderr merged, as a
/// terminal would show them) arrives on `output`. The pump ends when the
/// remote side closes, when `Close` is sent, when every input sender is
/// dropped, or when the output receiver is dropped.
pub(crate) async fn open_pty_shell(
    handle: &client::Handle<SshClientHandler>,
    size: PtySize,
) -> Result<ShellChannel, FleetError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FleetError::Command(format!("Failed to open channel: {}", e)))?;

    channel
        .request_pty(false, TERM, size.cols, size.rows, 0, 0, &[])
        .await
        .map_err(|e| FleetError::Command(format!("PTY request failed: {}", e)))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| FleetError::Command(format!("Shell request failed: {}", e)))?;

    let (input_tx, input_rx) = mpsc::channel::<ShellCommand>(SHELL_CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(SHELL_CHANNEL_CAPACITY);

    tokio::spawn(pump_shell(channel, input_rx, output_tx));

    Ok(ShellChannel {
        input: input_tx,
        output: output_rx,
    })
}

async fn pump_shell(
    mut channel: russh::Channel<client::Msg>,
    mut input: mpsc::Receiver<ShellCommand>,
    output: mpsc::Sender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            command = input.recv() => match command {
                Some(ShellCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Failed to write to shell channel: {}", e);
                        break;
                    }
                }
                Some(ShellCommand::Resize(size)) => {
                    if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                        // Resize failures leave the shell usable
                        warn!("Failed to resize PTY: {}", e);
                    }
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    if output.send(data.to_vec()).await.is_err() {
                        let _ = channel.close().await;
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    if output.send(data.to_vec()).await.is_err() {
                        let _ = channel.close().await;
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    debug!("Shell pump terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_address {
        use super::*;

        #[test]
        fn test_host_and_port() {
            assert_eq!(
                parse_address("example.com:2222").unwrap(),
                ("example.com".to_string(), 2222)
            );
        }

        #[test]
        fn test_default_port() {
            assert_eq!(
                parse_address("192.168.1.1").unwrap(),
                ("192.168.1.1".to_string(), 22)
            );
        }

        #[test]
        fn test_ipv6_bracketed() {
            assert_eq!(parse_address("[::1]:2222").unwrap(), ("::1".to_string(), 2222));
            assert_eq!(parse_address("[fe80::1]").unwrap(), ("fe80::1".to_string(), 22));
        }

        #[test]
        fn test_ipv6_bare_uses_default_port() {
            assert_eq!(parse_address("fe80::1").unwrap(), ("fe80::1".to_string(), 22));
            assert_eq!(parse_address("::1").unwrap(), ("::1".to_string(), 22));
        }

        #[test]
        fn test_invalid_port_is_validation_error() {
            assert!(matches!(
                parse_address("host:99999"),
                Err(FleetError::Validation(_))
            ));
            assert!(matches!(
                parse_address("host:ssh"),
                Err(FleetError::Validation(_))
            ));
            assert!(matches!(
                parse_address("[::1"),
                Err(FleetError::Validation(_))
            ));
            assert!(matches!(
                parse_address("[::1]22"),
                Err(FleetError::Validation(_))
            ));
        }
    }

    mod client_config {
        use super::*;

        #[test]
        fn test_no_inactivity_timeout() {
            let config = build_client_config(true);
            assert_eq!(config.inactivity_timeout, None);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_compression_preference() {
            let config = build_client_config(true);
            assert_eq!(config.preferred.compression.len(), 2);
            let config = build_client_config(false);
            assert_eq!(config.preferred.compression.len(), 1);
        }
    }

    mod deadlines {
        use super::*;
        use crate::fleet::hosts::test_host;

        #[tokio::test(start_paused = true)]
        async fn test_stalled_command_times_out() {
            let started = tokio::time::Instant::now();
            let result: Result<(), FleetError> = with_deadline(
                Duration::from_secs(5),
                "command",
                std::future::pending(),
            )
            .await;
            assert_eq!(
                result,
                Err(FleetError::Command("command timed out after 5s".into()))
            );
            assert_eq!(started.elapsed(), Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_finished_command_passes_through() {
            let result = with_deadline(Duration::from_secs(5), "command", async {
                Ok(CommandOutput::new("up", "", 0))
            })
            .await;
            assert_eq!(result, Ok(CommandOutput::new("up", "", 0)));
        }

        #[tokio::test]
        async fn test_silent_server_hits_connect_timeout() {
            // Accepts TCP but never sends an SSH banner
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            });

            let mut host = test_host("h1");
            host.address = address.to_string();
            let started = std::time::Instant::now();
            let result = connect_to_ssh(&host, None, Duration::from_millis(300), false).await;

            assert!(matches!(result, Err(FleetError::Connection(m)) if m.contains("timed out")));
            assert!(started.elapsed() < Duration::from_secs(5));
            server.abort();
        }
    }
}
