use std::{future::Future, io, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{io::AsyncWrite, stream::Stream};

use smtp_queue_types::QueueId;

use crate::MailMetadata;

/// A mail found sitting in the queue, ready to be picked up by
/// [`Storage::send_start`].
pub trait QueuedMail: 'static + Send + Sync {
    fn id(&self) -> QueueId;
    fn scheduled_at(&self) -> DateTime<Utc>;
    fn last_attempt(&self) -> Option<DateTime<Utc>>;
    fn retry_count(&self) -> u32;
}

/// A mail that is currently being sent, having been moved there atomically
/// by [`Storage::send_start`].
pub trait InflightMail: 'static + Send + Sync {
    fn id(&self) -> QueueId;
}

/// Handed back from [`Storage::enqueue`]: an `AsyncWrite` sink that the
/// caller streams the RFC5322 contents to, then finishes off by calling
/// `commit`.
#[async_trait]
pub trait StorageEnqueuer<QM: QueuedMail>: AsyncWrite + Unpin + Send {
    async fn commit(self) -> io::Result<QM>;
}

/// Abstract durable storage backend for the mail queue.
///
/// Implementations must guarantee that moving a mail between the "queue"
/// and "inflight" states (ie. `send_start`/`send_done`/`send_cancel`) is
/// atomic: a crash must never result in a mail being lost nor in it being
/// concurrently picked up by two workers.
#[async_trait]
pub trait Storage<U>: 'static + Send + Sync
where
    U: 'static + Send + Sync,
{
    type Enqueuer: StorageEnqueuer<Self::QueuedMail>;
    type InflightMail: InflightMail;
    type QueuedMail: QueuedMail;
    type Reader: futures::io::AsyncRead + Send + Unpin;

    /// Lists mails currently sitting in the queue, in no particular order.
    /// The `Option<QueueId>` in the error carries the id of the offending
    /// mail when it could be determined.
    async fn list_queue(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<Self::QueuedMail, (io::Error, Option<QueueId>)>>>>;

    /// Lists mails currently marked as inflight. Used at startup to recover
    /// mails left inflight by a previous, possibly crashed, process.
    async fn find_inflight(
        &self,
    ) -> Pin<
        Box<dyn Send + Stream<Item = Result<Self::InflightMail, (io::Error, Option<QueueId>)>>>,
    >;

    /// Reads back the metadata and contents of an inflight mail, so that it
    /// can be retried.
    async fn read_inflight(
        &self,
        mail: &Self::InflightMail,
    ) -> io::Result<(MailMetadata<U>, Self::Reader)>;

    /// Starts enqueuing a new mail with the given metadata already known
    /// (ie. after `MAIL FROM`/`RCPT TO` have been validated). The caller
    /// then streams the RFC5322 contents to the returned enqueuer and
    /// calls `commit`.
    fn enqueue<'s, 'a>(
        &'s self,
        meta: MailMetadata<U>,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = io::Result<Self::Enqueuer>>>>
    where
        's: 'a;

    /// Updates the schedule of a still-queued mail, eg. after a transient
    /// failure that should be retried later.
    async fn reschedule(
        &self,
        mail: &mut Self::QueuedMail,
        at: DateTime<Utc>,
        last_attempt: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> io::Result<()>;

    /// Atomically moves a mail from "queue" to "inflight". Returns `None` if
    /// the mail has vanished (eg. already picked up by another worker).
    fn send_start<'s, 'a>(
        &'s self,
        mail: Self::QueuedMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<Self::InflightMail>, (Self::QueuedMail, io::Error)>>,
        >,
    >
    where
        's: 'a;

    /// Marks an inflight mail as fully, successfully sent, removing it from
    /// the queue for good.
    fn send_done<'s, 'a>(
        &'s self,
        mail: Self::InflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (Self::InflightMail, io::Error)>>>>
    where
        's: 'a;

    /// Moves an inflight mail back to "queue" after a failed or cancelled
    /// delivery attempt. Returns `None` if the mail has vanished.
    fn send_cancel<'s, 'a>(
        &'s self,
        mail: Self::InflightMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<
                    Output = Result<Option<Self::QueuedMail>, (Self::InflightMail, io::Error)>,
                >,
        >,
    >
    where
        's: 'a;
}
