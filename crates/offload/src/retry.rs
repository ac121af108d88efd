use std::{thread, time::Duration};

use tracing::warn;

use crate::transport::TransportError;

/// Bounded retry of timeout-class failures with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves as one.
    pub attempts: u32,
    /// Sleep `backoff * attempt` between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut(u32) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(%label, attempt, error = %err, "transient send failure, retrying");
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
