//! Command execution seam for the fan-out queries.
//!
//! Collectors depend on [`CommandRunner`] rather than on the registry so the
//! same code runs against a live session or a scripted fake. [`run_with_retry`]
//! wraps each telemetry command in a fixed-delay retry using `backon`.
//!
//! Only execution errors (no session, channel failure, timeout) are retried. A
//! command that ran and exited non-zero is returned as-is. When every attempt
//! errors, a synthetic [`CommandOutput::failure`] carrying the last error is
//! returned so the parser sees "no data" instead of a propagated error.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tracing::{debug, warn};

use crate::fleet::config::CommandPolicy;
use crate::fleet::error::FleetError;
use crate::fleet::types::CommandOutput;

/// Runs one shell command on some host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, FleetError>;
}

/// Run `command` with up to `policy.attempts` attempts spaced by
/// `policy.retry_delay`.
pub async fn run_with_retry(
    runner: &dyn CommandRunner,
    command: &str,
    policy: CommandPolicy,
) -> CommandOutput {
    let attempt_counter = AtomicU32::new(0);

    let backoff = ConstantBuilder::default()
        .with_delay(policy.retry_delay)
        .with_max_times(policy.attempts.saturating_sub(1) as usize);

    let result = (|| async {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            debug!("Retry attempt {} for command: {}", attempt, command);
        }
        runner.run(command).await
    })
    .retry(backoff)
    .notify(|err, dur| {
        warn!(
            "Command '{}' failed: {}. Retrying in {:?}",
            command, err, dur
        );
    })
    .await;

    match result {
        Ok(output) => output,
        Err(e) => {
            warn!(
                "Command '{}' failed after {} attempt(s): {}",
                command,
                attempt_counter.load(Ordering::SeqCst),
                e
            );
            CommandOutput::failure(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed sequence of results and counts calls.
    struct Sequence {
        results: Mutex<VecDeque<Result<CommandOutput, FleetError>>>,
        calls: AtomicU32,
    }

    impl Sequence {
        fn new(results: Vec<Result<CommandOutput, FleetError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for Sequence {
        async fn run(&self, _command: &str) -> Result<CommandOutput, FleetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FleetError::Command("exhausted".into())))
        }
    }

    fn policy(attempts: u32) -> CommandPolicy {
        CommandPolicy {
            timeout: Duration::from_secs(5),
            attempts,
            retry_delay: Duration::from_millis(1000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_errors() {
        let runner = Sequence::new(vec![
            Err(FleetError::Command("channel".into())),
            Err(FleetError::Command("channel".into())),
            Ok(CommandOutput::new("ok", "", 0)),
        ]);
        let started = tokio::time::Instant::now();
        let output = run_with_retry(&runner, "npu-smi info -l", policy(3)).await;
        assert_eq!(output.stdout, "ok");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_yields_synthetic_failure() {
        let runner = Sequence::new(vec![]);
        let output = run_with_retry(&runner, "free -m", policy(3)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(output.exit_code, 1);
        assert!(output.stdout.is_empty());
        assert!(output.stderr.contains("exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_not_retried() {
        let runner = Sequence::new(vec![Ok(CommandOutput::new("", "not found", 127))]);
        let output = run_with_retry(&runner, "npu-smi info", policy(3)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.exit_code, 127);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let runner = Sequence::new(vec![]);
        run_with_retry(&runner, "df -h", policy(1)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
