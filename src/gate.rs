//! Submission pacing
//!
//! The portal throttles accounts and addresses that send requests in quick
//! succession, so every submission has to pass through a [`RateGate`] first.
//! Operators can confirm each request by hand ([`InteractiveGate`]) or let a
//! fixed cooldown pace the run ([`CooldownGate`]). After a refused request the
//! same batch is retried on a [`BackoffPolicy`] schedule.

use async_trait::async_trait;
use std::io::BufRead;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;
use crate::config::RetryConfig;
use crate::error::DlTdvmsError;

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Go-ahead for the next submission
#[async_trait]
pub trait RateGate: Send {
    /// Wait until `batch` may be submitted
    async fn acquire(&mut self, batch: &Batch, cancel: &CancellationToken) -> Result<()>;

    /// Called once a submission round-trip finished, successful or not
    fn submitted(&mut self) {}
}

/// Sleep for `duration` unless cancelled first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DlTdvmsError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Enforces a minimum interval between consecutive submissions
pub struct CooldownGate {
    interval: Duration,
    last: Option<Instant>,
}

impl CooldownGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }
}

#[async_trait]
impl RateGate for CooldownGate {
    async fn acquire(&mut self, batch: &Batch, cancel: &CancellationToken) -> Result<()> {
        if let Some(last) = self.last {
            let ready_at = last + self.interval;
            let now = Instant::now();
            if ready_at > now {
                let wait = ready_at - now;
                tracing::info!(
                    batch = batch.index,
                    wait_secs = wait.as_secs(),
                    "Cooling down before next request"
                );
                sleep_or_cancel(wait, cancel).await?;
            }
        }
        if cancel.is_cancelled() {
            return Err(DlTdvmsError::Cancelled);
        }
        Ok(())
    }

    fn submitted(&mut self) {
        self.last = Some(Instant::now());
    }
}

type SharedReader = Arc<Mutex<Box<dyn BufRead + Send>>>;

/// Waits for the operator to press enter before each submission.
/// Typing `q` (or closing the input) stops the run.
pub struct InteractiveGate {
    input: SharedReader,
}

impl InteractiveGate {
    pub fn new() -> Self {
        Self::with_reader(std::io::BufReader::new(std::io::stdin()))
    }

    pub fn with_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        Self {
            input: Arc::new(Mutex::new(Box::new(reader))),
        }
    }
}

impl Default for InteractiveGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateGate for InteractiveGate {
    async fn acquire(&mut self, batch: &Batch, cancel: &CancellationToken) -> Result<()> {
        println!();
        println!(
            "Press enter to request batch {} ({} stations, {}), or q to stop: ",
            batch.index,
            batch.len(),
            batch.data_format
        );

        // plain thread: runtime shutdown waits for spawn_blocking tasks
        let input = self.input.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = match input.lock() {
                Ok(mut reader) => reader.read_line(&mut line).map(|n| (n, line)),
                Err(_) => Err(std::io::Error::other("input reader poisoned")),
            };
            let _ = tx.send(read);
        });

        let (bytes, line) = tokio::select! {
            _ = cancel.cancelled() => return Err(DlTdvmsError::Cancelled),
            read = rx => read
                .map_err(|_| DlTdvmsError::Io(std::io::Error::other("input reader stopped")))??,
        };

        if bytes == 0 || line.trim().eq_ignore_ascii_case("q") {
            tracing::info!("Stopped by operator");
            return Err(DlTdvmsError::Cancelled);
        }
        Ok(())
    }
}

/// Exponential backoff for retrying a refused submission
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_secs = delay.as_secs(),
            "Waiting before retrying request"
        );
        sleep_or_cancel(delay, cancel).await
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_secs(config.initial_delay),
            max_delay: Duration::from_secs(config.max_delay),
            multiplier: config.backoff_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::DataFormat;
    use std::io::Cursor;

    fn batch() -> Batch {
        Batch {
            index: 4,
            data_format: DataFormat::Mseed,
            stations: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_waits_between_submissions() {
        let cancel = CancellationToken::new();
        let mut gate = CooldownGate::new(Duration::from_secs(120));

        let start = Instant::now();
        gate.acquire(&batch(), &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        gate.submitted();

        gate.acquire(&batch(), &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_cancellable() {
        let cancel = CancellationToken::new();
        let mut gate = CooldownGate::new(Duration::from_secs(3600));
        gate.submitted();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert!(matches!(
            gate.acquire(&batch(), &cancel).await,
            Err(DlTdvmsError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_interactive_gate_reads_lines() {
        let cancel = CancellationToken::new();
        let mut gate = InteractiveGate::with_reader(Cursor::new(b"\n\nq\n".to_vec()));
        gate.acquire(&batch(), &cancel).await.unwrap();
        gate.acquire(&batch(), &cancel).await.unwrap();
        assert!(matches!(
            gate.acquire(&batch(), &cancel).await,
            Err(DlTdvmsError::Cancelled)
        ));
        // end of input also stops
        assert!(gate.acquire(&batch(), &cancel).await.is_err());
    }

    /// Input that never arrives while the sender is alive
    struct Stalled(std::sync::mpsc::Receiver<Vec<u8>>);

    impl std::io::Read for Stalled {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let data = self.0.recv().map_err(|_| std::io::Error::other("closed"))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_cancelled_prompt_does_not_block_shutdown() {
        let (_keep, rx) = std::sync::mpsc::channel();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let result = runtime.block_on(async {
            let mut gate = InteractiveGate::with_reader(std::io::BufReader::new(Stalled(rx)));
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            });
            gate.acquire(&batch(), &cancel).await
        });
        assert!(matches!(result, Err(DlTdvmsError::Cancelled)));

        let started = std::time::Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = BackoffPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(200),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(200));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
