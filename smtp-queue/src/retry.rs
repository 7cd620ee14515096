use std::time::Duration;

use chrono::Utc;
use futures::io::Cursor;

use crate::{
    transport::{Transport, TransportFailure, TransportSender},
    MailMetadata,
};

/// Wraps a single delivery attempt in an in-process, exponential-backoff
/// retry loop: `base * 2^n`, where `n` is the number of attempts already
/// made.
///
/// The loop holds the upstream connection and the in-flight queue entry for
/// its entire duration — it never writes back to durable storage between
/// attempts. Storage only sees the outcome once [`RetryManager::send`]
/// finally returns, either because a send succeeded or because the retry
/// budget was exhausted.
#[derive(Clone, Copy, Debug)]
pub struct RetryManager {
    base_delay: Duration,
    max_retries: u32,
}

impl RetryManager {
    pub fn new(base_delay: Duration, max_retries: u32) -> RetryManager {
        RetryManager {
            base_delay,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay to wait before the `retry_count`-th retry (0-indexed: the delay
    /// before the very first retry is `base_delay`).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32.checked_shl(retry_count).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }

    /// Delivers `body` to `meta`'s recipients through `transport`, retrying
    /// in-process (connecting afresh each attempt, since a transport error
    /// invalidates the connection) until it succeeds or the retry budget
    /// tracked by `retry_count`/`last_attempt` is exhausted.
    ///
    /// `retry_count` and `last_attempt` are updated in place as attempts are
    /// made, so the caller can persist the final values alongside the
    /// outcome. A permanent failure (one `TransportFailure` itself reports as
    /// non-transient) ends the loop immediately regardless of budget.
    pub async fn send<U, T>(
        &self,
        transport: &T,
        meta: &MailMetadata<U>,
        body: Vec<u8>,
        retry_count: &mut u32,
        last_attempt: &mut Option<chrono::DateTime<Utc>>,
    ) -> Result<(), TransportFailure>
    where
        U: 'static + Send + Sync,
        T: Transport<U>,
    {
        loop {
            let outcome = match transport.connect().await {
                Ok(mut sender) => sender.send(meta, Cursor::new(body.clone())).await,
                Err(failure) => Err(failure),
            };

            let failure = match outcome {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if !failure.is_transient() || !self.can_retry(*retry_count) {
                return Err(failure);
            }

            let delay = self.delay_for(*retry_count);
            *retry_count += 1;
            *last_attempt = Some(Utc::now());
            smol::Timer::after(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let mgr = RetryManager::new(Duration::from_secs(10), 5);
        assert_eq!(mgr.delay_for(0), Duration::from_secs(10));
        assert_eq!(mgr.delay_for(1), Duration::from_secs(20));
        assert_eq!(mgr.delay_for(2), Duration::from_secs(40));
    }

    #[test]
    fn can_retry_respects_max() {
        let mgr = RetryManager::new(Duration::from_secs(1), 3);
        assert!(mgr.can_retry(0));
        assert!(mgr.can_retry(2));
        assert!(!mgr.can_retry(3));
    }
}
