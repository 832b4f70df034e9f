use std::fmt;
use std::future::Future;
use std::time;

use thiserror::Error;
use tracing::{info, warn};

/// Error returned once every attempt allowed by a `StartupRetry` has failed.
#[derive(Error, Debug)]
#[error("{target} still unavailable after {attempts} attempts: {last_error}")]
pub struct RetryError<E: fmt::Display + fmt::Debug> {
    pub target: String,
    pub attempts: u32,
    pub last_error: E,
}

/// Fixed-count, fixed-delay retry policy for dependencies that must be reachable at startup.
#[derive(Copy, Clone, Debug)]
pub struct StartupRetry {
    /// Number of attempts made before giving up. Always at least one.
    max_attempts: u32,
    /// Pause between two attempts.
    delay: time::Duration,
}

impl StartupRetry {
    pub fn new(max_attempts: u32, delay: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `connect` until it succeeds or the attempts are exhausted.
    pub async fn run<T, E, F, Fut>(&self, target: &str, mut connect: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;

        loop {
            info!(
                attempt,
                max_attempts = self.max_attempts,
                "connecting to {}", target
            );

            match connect().await {
                Ok(value) => {
                    info!("connected to {}", target);
                    return Ok(value);
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(RetryError {
                        target: target.to_owned(),
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => {
                    warn!(
                        "{} not ready, retrying in {:?}: {}",
                        target, self.delay, error
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: time::Duration::from_secs(3),
        }
    }
}
