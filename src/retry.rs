//! Bounded retry for transient storage failures.
//!
//! Pool exhaustion, dropped connections, serialization failures and deadlocks
//! are retried with linear backoff (`base_delay * attempt`). Once attempts run
//! out the caller sees [`EngineError::Unavailable`]; any other storage error
//! is surfaced immediately as [`EngineError::Internal`].

use std::future::Future;
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use tracing::warn;

use crate::error::EngineError;

/// PostgreSQL SQLSTATEs worth retrying: serialization_failure,
/// deadlock_detected, lock_not_available, too_many_connections.
const TRANSIENT_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "53300"];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    retries: Counter,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            retries: Counter::default(),
        }
    }

    /// Count retries into a shared counter (e.g. the Prometheus registry's).
    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.retries = counter;
        self
    }

    pub fn retries(&self) -> u64 {
        self.retries.get()
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts attempts.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => {
                    if attempt >= self.max_attempts {
                        warn!(op = op_name, attempts = attempt, error = %e, "storage still failing, giving up");
                        return Err(EngineError::Unavailable(format!("{}: {}", op_name, e)));
                    }
                    warn!(op = op_name, attempt, error = %e, "transient storage error, retrying");
                    self.retries.inc();
                    tokio::time::sleep(self.base_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::Internal(e.context(op_name.to_string()))),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

/// Classify a storage error as transient.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    match sqlx_err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&&*code))
            .unwrap_or(false),
        _ => false,
    }
}
