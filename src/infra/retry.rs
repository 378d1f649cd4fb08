//! Jittered exponential backoff for collaborator calls

use crate::infra::config::RetryConfig;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay_ms, config.max_delay_ms, config.jitter_pct)
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self::new(1, 1, 1, 0.0)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let delay = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    sleep(self.next_delay(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
