/// Backoff policy for transient upstream failures. Attempts are counted
/// including the first try, so `max_attempts = 3` means at most two retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt` (zero-based).
    pub fn delay_ms(&self, attempt: usize) -> u64 {
        let mut delay = self.initial_delay_ms;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.multiplier.max(1));
            if delay >= self.max_delay_ms {
                return self.max_delay_ms;
            }
        }
        delay.min(self.max_delay_ms)
    }

    pub fn allows_retry(&self, attempt: usize) -> bool {
        attempt + 1 < self.max_attempts.max(1)
    }
}

/// 5xx replies are retryable; 4xx (including auth challenges dressed as
/// 403) are not.
pub fn should_retry_status(status: u16) -> bool {
    status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
