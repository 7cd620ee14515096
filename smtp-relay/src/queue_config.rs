use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use smtp_queue::QueueId;

/// `next_interval` is required by the trait but, per `smtp_queue::run`'s
/// actual loop, only the `RetryManager` passed to `run` decides retry
/// timing; this config's backoff knobs exist for trait conformance and
/// for any future caller that schedules off `next_interval` directly.
pub struct QueueConfig {
    retry_delay_base: Duration,
}

impl QueueConfig {
    pub fn new(retry_delay_base: Duration) -> QueueConfig {
        QueueConfig { retry_delay_base }
    }
}

#[async_trait]
impl smtp_queue::Config<(), std::io::Error> for QueueConfig {
    async fn next_interval(&self, s: smtp_queue::ScheduleInfo) -> Option<Duration> {
        Some(
            self.retry_delay_base
                .checked_mul(1u32.checked_shl(s.retry_count).unwrap_or(u32::MAX))
                .unwrap_or(Duration::MAX),
        )
    }

    async fn log_storage_error(&self, err: std::io::Error, id: Option<QueueId>) {
        error!(error = %err, ?id, "queue storage error");
    }

    async fn log_found_inflight(&self, inflight: QueueId) {
        warn!(id = ?inflight, "recovering mail found inflight at startup");
    }

    async fn log_found_pending_cleanup(&self, pcm: QueueId) {
        debug!(id = ?pcm, "found a pending cleanup entry");
    }

    async fn log_queued_mail_vanished(&self, id: QueueId) {
        warn!(?id, "queued mail vanished before it could be picked up");
    }

    async fn log_inflight_mail_vanished(&self, id: QueueId) {
        warn!(?id, "inflight mail vanished during recovery");
    }

    async fn log_pending_cleanup_mail_vanished(&self, id: QueueId) {
        warn!(?id, "pending cleanup mail vanished");
    }

    async fn log_too_big_duration(&self, id: QueueId, too_big: Duration, new: Duration) {
        warn!(?id, ?too_big, ?new, "clamping an overly long retry delay");
    }

    fn found_inflight_check_delay(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn io_error_next_retry_delay(&self, d: Duration) -> Duration {
        if d < Duration::from_secs(30) {
            Duration::from_secs(60)
        } else {
            d.mul_f64(2.0)
        }
    }
}
