use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Bounded exponential backoff for transient backend failures
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Error)]
#[error("maximum retry attempts exceeded ({0})")]
pub struct MaxRetriesExceeded(pub u32);

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay the next attempt would wait
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded(self.max_retries));
        }

        let delay = self.next_delay();

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(35), 5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        backoff.current_attempt = 1;
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        backoff.current_attempt = 2;
        assert_eq!(backoff.next_delay(), Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(1), 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(backoff.sleep().await.is_ok());
    }
}
