//! Bounded linear retry around backup queries.

use crate::error::BackupError;
use crate::models::BlankRecord;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal result of a retried query. Every run yields exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome<T> {
    /// A non-blank record was returned on attempt `attempts`
    Found { record: T, attempts: u32 },
    /// Every attempt returned a blank record
    NotFound { attempts: u32 },
    /// The last attempt failed with `error`
    Failed { error: BackupError, attempts: u32 },
}

impl<T> QueryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            QueryOutcome::Found { attempts, .. }
            | QueryOutcome::NotFound { attempts }
            | QueryOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueryOutcome::Found { .. } => "found",
            QueryOutcome::NotFound { .. } => "not_found",
            QueryOutcome::Failed { .. } => "failed",
        }
    }
}

/// Fixed number of sequential attempts with a fixed delay in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` below one is raised to one
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `query` until it yields a non-blank record or attempts run out.
    ///
    /// Blank records and failures both trigger another attempt. After the last
    /// attempt a blank record becomes [`QueryOutcome::NotFound`] and a failure
    /// becomes [`QueryOutcome::Failed`] carrying that attempt's error.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut query: F) -> QueryOutcome<T>
    where
        T: BlankRecord,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackupError>>,
    {
        let mut attempt = 1;
        loop {
            metrics::counter!("backup.query.attempts", "operation" => operation).increment(1);

            let last_attempt = attempt >= self.max_attempts;
            match query().await {
                Ok(record) if !record.is_blank() => {
                    debug!(operation, attempt, "Query returned a record");
                    return QueryOutcome::Found {
                        record,
                        attempts: attempt,
                    };
                }
                Ok(_) if last_attempt => {
                    return QueryOutcome::NotFound { attempts: attempt };
                }
                Err(error) if last_attempt => {
                    return QueryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
                Ok(_) => {
                    debug!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "No backup found yet, retrying"
                    );
                }
                Err(error) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Query failed, retrying"
                    );
                }
            }

            tokio::time::sleep(self.delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(2))
    }
}
