//! Dispatch across the two pluggable queue backends.
//!
//! `smtp_queue::run` is generic over a single concrete `Storage<U>`
//! implementation, but the backend to use is a runtime choice (`queue.backend`
//! in the config). `AnyStorage` and its companion `Any*` types pick the
//! concrete backend once at startup and implement the `Storage` sub-traits by
//! delegating to whichever variant was constructed.

use std::{
    future::Future,
    io,
    pin::Pin,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    io::AsyncWrite,
    stream::Stream,
    task::{Context, Poll},
    StreamExt,
};

use smtp_queue::{InflightMail, MailMetadata, QueueId, QueuedMail, Storage, StorageEnqueuer};
use smtp_queue_kv::KvStorage;
use smtp_queue_sql::SqlStorage;

#[derive(Clone)]
pub enum AnyStorage {
    Kv(KvStorage<()>),
    Sql(SqlStorage<()>),
}

pub enum AnyQueuedMail {
    Kv(smtp_queue_kv::KvQueuedMail),
    Sql(smtp_queue_sql::SqlQueuedMail),
}

impl QueuedMail for AnyQueuedMail {
    fn id(&self) -> QueueId {
        match self {
            AnyQueuedMail::Kv(m) => m.id(),
            AnyQueuedMail::Sql(m) => m.id(),
        }
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        match self {
            AnyQueuedMail::Kv(m) => m.scheduled_at(),
            AnyQueuedMail::Sql(m) => m.scheduled_at(),
        }
    }

    fn last_attempt(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyQueuedMail::Kv(m) => m.last_attempt(),
            AnyQueuedMail::Sql(m) => m.last_attempt(),
        }
    }

    fn retry_count(&self) -> u32 {
        match self {
            AnyQueuedMail::Kv(m) => m.retry_count(),
            AnyQueuedMail::Sql(m) => m.retry_count(),
        }
    }
}

pub enum AnyInflightMail {
    Kv(smtp_queue_kv::KvInflightMail),
    Sql(smtp_queue_sql::SqlInflightMail),
}

impl InflightMail for AnyInflightMail {
    fn id(&self) -> QueueId {
        match self {
            AnyInflightMail::Kv(m) => m.id(),
            AnyInflightMail::Sql(m) => m.id(),
        }
    }
}

pub enum AnyEnqueuer {
    Kv(smtp_queue_kv::KvEnqueuer<()>),
    Sql(smtp_queue_sql::SqlEnqueuer<()>),
}

impl AsyncWrite for AnyEnqueuer {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AnyEnqueuer::Kv(e) => Pin::new(e).poll_write(cx, buf),
            AnyEnqueuer::Sql(e) => Pin::new(e).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyEnqueuer::Kv(e) => Pin::new(e).poll_flush(cx),
            AnyEnqueuer::Sql(e) => Pin::new(e).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyEnqueuer::Kv(e) => Pin::new(e).poll_close(cx),
            AnyEnqueuer::Sql(e) => Pin::new(e).poll_close(cx),
        }
    }
}

#[async_trait]
impl StorageEnqueuer<AnyQueuedMail> for AnyEnqueuer {
    async fn commit(self) -> io::Result<AnyQueuedMail> {
        match self {
            AnyEnqueuer::Kv(e) => e.commit().await.map(AnyQueuedMail::Kv),
            AnyEnqueuer::Sql(e) => e.commit().await.map(AnyQueuedMail::Sql),
        }
    }
}

#[async_trait]
impl Storage<()> for AnyStorage {
    type Enqueuer = AnyEnqueuer;
    type InflightMail = AnyInflightMail;
    type QueuedMail = AnyQueuedMail;
    type Reader = io::Cursor<Vec<u8>>;

    async fn list_queue(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<AnyQueuedMail, (io::Error, Option<QueueId>)>>>>
    {
        match self {
            AnyStorage::Kv(s) => Box::pin(
                s.list_queue()
                    .await
                    .map(|r| r.map(AnyQueuedMail::Kv)),
            ),
            AnyStorage::Sql(s) => Box::pin(
                s.list_queue()
                    .await
                    .map(|r| r.map(AnyQueuedMail::Sql)),
            ),
        }
    }

    async fn find_inflight(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<AnyInflightMail, (io::Error, Option<QueueId>)>>>>
    {
        match self {
            AnyStorage::Kv(s) => Box::pin(
                s.find_inflight()
                    .await
                    .map(|r| r.map(AnyInflightMail::Kv)),
            ),
            AnyStorage::Sql(s) => Box::pin(
                s.find_inflight()
                    .await
                    .map(|r| r.map(AnyInflightMail::Sql)),
            ),
        }
    }

    async fn read_inflight(
        &self,
        mail: &AnyInflightMail,
    ) -> io::Result<(MailMetadata<()>, io::Cursor<Vec<u8>>)> {
        match (self, mail) {
            (AnyStorage::Kv(s), AnyInflightMail::Kv(m)) => s.read_inflight(m).await,
            (AnyStorage::Sql(s), AnyInflightMail::Sql(m)) => s.read_inflight(m).await,
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "inflight mail does not belong to the configured backend",
            )),
        }
    }

    fn enqueue<'s, 'a>(
        &'s self,
        meta: MailMetadata<()>,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = io::Result<AnyEnqueuer>>>>
    where
        's: 'a,
    {
        match self {
            AnyStorage::Kv(s) => {
                Box::pin(async move { Ok(AnyEnqueuer::Kv(s.enqueue(meta).await?)) })
            }
            AnyStorage::Sql(s) => {
                Box::pin(async move { Ok(AnyEnqueuer::Sql(s.enqueue(meta).await?)) })
            }
        }
    }

    async fn reschedule(
        &self,
        mail: &mut AnyQueuedMail,
        at: DateTime<Utc>,
        last_attempt: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> io::Result<()> {
        match (self, mail) {
            (AnyStorage::Kv(s), AnyQueuedMail::Kv(m)) => {
                s.reschedule(m, at, last_attempt, retry_count).await
            }
            (AnyStorage::Sql(s), AnyQueuedMail::Sql(m)) => {
                s.reschedule(m, at, last_attempt, retry_count).await
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "queued mail does not belong to the configured backend",
            )),
        }
    }

    fn send_start<'s, 'a>(
        &'s self,
        mail: AnyQueuedMail,
    ) -> Pin<
        Box<dyn 'a + Send + Future<Output = Result<Option<AnyInflightMail>, (AnyQueuedMail, io::Error)>>>,
    >
    where
        's: 'a,
    {
        match (self, mail) {
            (AnyStorage::Kv(s), AnyQueuedMail::Kv(m)) => Box::pin(async move {
                match s.send_start(m).await {
                    Ok(inflight) => Ok(inflight.map(AnyInflightMail::Kv)),
                    Err((m, e)) => Err((AnyQueuedMail::Kv(m), e)),
                }
            }),
            (AnyStorage::Sql(s), AnyQueuedMail::Sql(m)) => Box::pin(async move {
                match s.send_start(m).await {
                    Ok(inflight) => Ok(inflight.map(AnyInflightMail::Sql)),
                    Err((m, e)) => Err((AnyQueuedMail::Sql(m), e)),
                }
            }),
            (_, mail) => Box::pin(async move {
                Err((
                    mail,
                    io::Error::new(
                        io::ErrorKind::Other,
                        "queued mail does not belong to the configured backend",
                    ),
                ))
            }),
        }
    }

    fn send_done<'s, 'a>(
        &'s self,
        mail: AnyInflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (AnyInflightMail, io::Error)>>>>
    where
        's: 'a,
    {
        match (self, mail) {
            (AnyStorage::Kv(s), AnyInflightMail::Kv(m)) => Box::pin(async move {
                s.send_done(m).await.map_err(|(m, e)| (AnyInflightMail::Kv(m), e))
            }),
            (AnyStorage::Sql(s), AnyInflightMail::Sql(m)) => Box::pin(async move {
                s.send_done(m).await.map_err(|(m, e)| (AnyInflightMail::Sql(m), e))
            }),
            (_, mail) => Box::pin(async move {
                Err((
                    mail,
                    io::Error::new(
                        io::ErrorKind::Other,
                        "inflight mail does not belong to the configured backend",
                    ),
                ))
            }),
        }
    }

    fn send_cancel<'s, 'a>(
        &'s self,
        mail: AnyInflightMail,
    ) -> Pin<
        Box<dyn 'a + Send + Future<Output = Result<Option<AnyQueuedMail>, (AnyInflightMail, io::Error)>>>,
    >
    where
        's: 'a,
    {
        match (self, mail) {
            (AnyStorage::Kv(s), AnyInflightMail::Kv(m)) => Box::pin(async move {
                match s.send_cancel(m).await {
                    Ok(queued) => Ok(queued.map(AnyQueuedMail::Kv)),
                    Err((m, e)) => Err((AnyInflightMail::Kv(m), e)),
                }
            }),
            (AnyStorage::Sql(s), AnyInflightMail::Sql(m)) => Box::pin(async move {
                match s.send_cancel(m).await {
                    Ok(queued) => Ok(queued.map(AnyQueuedMail::Sql)),
                    Err((m, e)) => Err((AnyInflightMail::Sql(m), e)),
                }
            }),
            (_, mail) => Box::pin(async move {
                Err((
                    mail,
                    io::Error::new(
                        io::ErrorKind::Other,
                        "inflight mail does not belong to the configured backend",
                    ),
                ))
            }),
        }
    }
}
