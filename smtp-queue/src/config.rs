use std::time::Duration;

use async_trait::async_trait;

use smtp_queue_types::{QueueId, ScheduleInfo};

/// Policy and logging hooks for the queue worker.
///
/// `U` is the per-connection user-defined metadata type (see
/// [`crate::MailMetadata`]), and `E` is the error type returned by the
/// [`crate::Storage`] backend in use.
#[async_trait]
pub trait Config<U, E>: 'static + Send + Sync
where
    U: 'static + Send + Sync,
    E: 'static + Send + Sync,
{
    /// Computes the delay before the next delivery attempt, given the
    /// mail's current schedule. Returning `None` gives up on the mail for
    /// good (eg. after a configured maximum retry count has been reached).
    async fn next_interval(&self, s: ScheduleInfo) -> Option<Duration>;

    /// Called whenever the storage backend returns an error unrelated to
    /// any specific mail operation (eg. while listing the queue).
    async fn log_storage_error(&self, err: E, id: Option<QueueId>);

    /// Called once per mail found inflight at startup, before the worker
    /// decides whether to resume or requeue it.
    async fn log_found_inflight(&self, inflight: QueueId);

    /// Called once per mail found pending cleanup at startup.
    async fn log_found_pending_cleanup(&self, pcm: QueueId);

    /// Called when a mail that was listed in the queue has vanished by the
    /// time it was about to be picked up.
    async fn log_queued_mail_vanished(&self, id: QueueId);

    /// Called when a mail that was listed as inflight has vanished by the
    /// time it was about to be resumed.
    async fn log_inflight_mail_vanished(&self, id: QueueId);

    /// Called when a mail pending cleanup has vanished before cleanup could
    /// complete.
    async fn log_pending_cleanup_mail_vanished(&self, id: QueueId);

    /// Called when a mail has been found inflight for an implausibly long
    /// duration, and its schedule is being clamped down to `new`.
    async fn log_too_big_duration(&self, id: QueueId, too_big: Duration, new: Duration);

    /// How long to wait, on average, between two scans of the inflight
    /// directory for mails that may have been abandoned by a crashed
    /// worker.
    fn found_inflight_check_delay(&self) -> Duration;

    /// Computes the delay before retrying after the storage backend itself
    /// returned an I/O error (as opposed to a delivery failure), given the
    /// previous such delay.
    fn io_error_next_retry_delay(&self, d: Duration) -> Duration {
        if d < Duration::from_secs(30) {
            Duration::from_secs(60)
        } else {
            d.mul_f64(2.0)
        }
    }
}
