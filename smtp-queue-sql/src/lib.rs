use std::{
    future::Future,
    io,
    marker::PhantomData,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{io::AsyncWrite, prelude::*};
use rusqlite::{params, OptionalExtension};
use smtp_queue::{MailMetadata, QueueId};
use uuid::Uuid;

// Schema:
//   CREATE TABLE smtp_queue (
//     id           TEXT PRIMARY KEY,
//     status       TEXT NOT NULL CHECK (status IN ('queued', 'inflight')),
//     from_addr    TEXT,
//     to_addrs     TEXT NOT NULL,     -- JSON array of addresses
//     meta         TEXT NOT NULL,     -- JSON-encoded MailMetadata<U>
//     contents     BLOB NOT NULL,     -- already-escaped RFC5322 DATA payload
//     created_at   INTEGER NOT NULL,
//     scheduled_at INTEGER NOT NULL,
//     last_attempt INTEGER,
//     retry_count  INTEGER NOT NULL
//   )
//
// `from_addr`/`to_addrs` are kept as plain columns (denormalized from
// `meta`, which stays the authoritative, round-trippable copy) so external
// tooling can query by recipient without deserializing `meta`. `status`
// here tracks this row's position in the queue/inflight lifecycle, not a
// delivered mail's terminal disposition — a row is deleted outright once
// delivery finally succeeds or the retry budget is exhausted, so there is
// no 'sent'/'failed' status to store.
//
// `send_start` moves a row from `queued` to `inflight` with a single
// `UPDATE ... WHERE id = ?1 AND status = 'queued'` statement checked for
// `changes() == 1`: unlike a SELECT-then-UPDATE dequeue, this can never race
// two workers into both picking up the same mail.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

struct SqlStorageImpl<U> {
    conn: Mutex<rusqlite::Connection>,
    phantom: PhantomData<U>,
}

pub struct SqlStorage<U> {
    s: Arc<SqlStorageImpl<U>>,
}

impl<U> Clone for SqlStorage<U> {
    fn clone(&self) -> SqlStorage<U> {
        SqlStorage { s: self.s.clone() }
    }
}

impl<U> SqlStorage<U> {
    pub async fn new(path: impl AsRef<Path>) -> Result<SqlStorage<U>, Error> {
        let path = path.as_ref().to_owned();
        let conn = smol::unblock(move || -> Result<rusqlite::Connection, rusqlite::Error> {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS smtp_queue (
                    id           TEXT PRIMARY KEY,
                    status       TEXT NOT NULL CHECK (status IN ('queued', 'inflight')),
                    from_addr    TEXT,
                    to_addrs     TEXT NOT NULL,
                    meta         TEXT NOT NULL,
                    contents     BLOB NOT NULL,
                    created_at   INTEGER NOT NULL,
                    scheduled_at INTEGER NOT NULL,
                    last_attempt INTEGER,
                    retry_count  INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS smtp_queue_status_idx
                    ON smtp_queue (status, scheduled_at, created_at);",
            )?;
            Ok(conn)
        })
        .await?;
        Ok(SqlStorage {
            s: Arc::new(SqlStorageImpl {
                conn: Mutex::new(conn),
                phantom: PhantomData,
            }),
        })
    }
}

fn run_blocking<U, F, T>(this: &SqlStorage<U>, f: F) -> impl Future<Output = Result<T, Error>>
where
    U: 'static + Send + Sync,
    F: 'static + Send + FnOnce(&rusqlite::Connection) -> Result<T, Error>,
    T: 'static + Send,
{
    let this = this.clone();
    smol::unblock(move || {
        let conn = this.s.conn.lock().unwrap();
        f(&conn)
    })
}

#[async_trait]
impl<U> smtp_queue::Storage<U> for SqlStorage<U>
where
    U: 'static + Send + Sync + Unpin + for<'a> serde::Deserialize<'a> + serde::Serialize,
{
    type Enqueuer = SqlEnqueuer<U>;
    type InflightMail = SqlInflightMail;
    type QueuedMail = SqlQueuedMail;
    type Reader = futures::io::Cursor<Vec<u8>>;

    async fn list_queue(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<SqlQueuedMail, (io::Error, Option<QueueId>)>>>>
    {
        let rows: Result<Vec<SqlQueuedMail>, Error> = run_blocking(self, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scheduled_at, last_attempt, retry_count FROM smtp_queue WHERE status = 'queued'",
            )?;
            let rows = stmt
                .query_map([], row_to_queued_mail)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await;
        match rows {
            Ok(rows) => Box::pin(futures::stream::iter(rows.into_iter().map(Ok))),
            Err(e) => Box::pin(futures::stream::once(async move {
                Err((io::Error::from(e), None))
            })),
        }
    }

    async fn find_inflight(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<SqlInflightMail, (io::Error, Option<QueueId>)>>>>
    {
        let rows: Result<Vec<SqlInflightMail>, Error> = run_blocking(self, |conn| {
            let mut stmt = conn.prepare("SELECT id FROM smtp_queue WHERE status = 'inflight'")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SqlInflightMail {
                        id: QueueId::new(row.get::<_, String>(0)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await;
        match rows {
            Ok(rows) => Box::pin(futures::stream::iter(rows.into_iter().map(Ok))),
            Err(e) => Box::pin(futures::stream::once(async move {
                Err((io::Error::from(e), None))
            })),
        }
    }

    async fn read_inflight(
        &self,
        mail: &SqlInflightMail,
    ) -> io::Result<(MailMetadata<U>, futures::io::Cursor<Vec<u8>>)> {
        let id = mail.id.0.to_string();
        let (meta_json, contents): (String, Vec<u8>) = run_blocking(self, move |conn| {
            Ok(conn.query_row(
                "SELECT meta, contents FROM smtp_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await?;
        let meta = serde_json::from_str(&meta_json).map_err(Error::from)?;
        Ok((meta, futures::io::Cursor::new(contents)))
    }

    fn enqueue<'s, 'a>(
        &'s self,
        meta: MailMetadata<U>,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = io::Result<SqlEnqueuer<U>>>>>
    where
        's: 'a,
    {
        Box::pin(async move {
            Ok(SqlEnqueuer {
                storage: self.clone(),
                meta,
                buf: Vec::new(),
            })
        })
    }

    async fn reschedule(
        &self,
        mail: &mut SqlQueuedMail,
        at: DateTime<Utc>,
        last_attempt: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> io::Result<()> {
        mail.scheduled = at;
        mail.last_attempt = last_attempt;
        mail.retry_count = retry_count;
        let id = mail.id.0.to_string();
        run_blocking(self, move |conn| {
            conn.execute(
                "UPDATE smtp_queue SET scheduled_at = ?1, last_attempt = ?2, retry_count = ?3 WHERE id = ?4",
                params![at.timestamp(), last_attempt.map(|d| d.timestamp()), retry_count, id],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    fn send_start<'s, 'a>(
        &'s self,
        mail: SqlQueuedMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<SqlInflightMail>, (SqlQueuedMail, io::Error)>>,
        >,
    >
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let moved: Result<bool, Error> = run_blocking(self, move |conn| {
                let changed = conn.execute(
                    "UPDATE smtp_queue SET status = 'inflight' WHERE id = ?1 AND status = 'queued'",
                    params![id],
                )?;
                Ok(changed == 1)
            })
            .await;
            match moved {
                Ok(true) => Ok(Some(SqlInflightMail {
                    id: mail.id.clone(),
                })),
                Ok(false) => Ok(None),
                Err(e) => Err((mail, io::Error::from(e))),
            }
        })
    }

    fn send_done<'s, 'a>(
        &'s self,
        mail: SqlInflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (SqlInflightMail, io::Error)>>>>
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let result: Result<(), Error> = run_blocking(self, move |conn| {
                conn.execute("DELETE FROM smtp_queue WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await;
            result.map_err(|e| (mail, io::Error::from(e)))
        })
    }

    fn send_cancel<'s, 'a>(
        &'s self,
        mail: SqlInflightMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<SqlQueuedMail>, (SqlInflightMail, io::Error)>>,
        >,
    >
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let row: Result<Option<SqlQueuedMail>, Error> = run_blocking(self, move |conn| {
                let changed = conn.execute(
                    "UPDATE smtp_queue SET status = 'queued' WHERE id = ?1 AND status = 'inflight'",
                    params![id],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(conn
                    .query_row(
                        "SELECT id, scheduled_at, last_attempt, retry_count FROM smtp_queue WHERE id = ?1",
                        params![id],
                        row_to_queued_mail,
                    )
                    .optional()?)
            })
            .await;
            match row {
                Ok(mail) => Ok(mail),
                Err(e) => Err((mail, io::Error::from(e))),
            }
        })
    }
}

fn row_to_queued_mail(row: &rusqlite::Row) -> rusqlite::Result<SqlQueuedMail> {
    let id: String = row.get(0)?;
    let scheduled: i64 = row.get(1)?;
    let last_attempt: Option<i64> = row.get(2)?;
    let retry_count: u32 = row.get(3)?;
    Ok(SqlQueuedMail {
        id: QueueId::new(id),
        scheduled: Utc.timestamp(scheduled, 0),
        last_attempt: last_attempt.map(|t| Utc.timestamp(t, 0)),
        retry_count,
    })
}

#[derive(Clone)]
pub struct SqlQueuedMail {
    id: QueueId,
    scheduled: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
    retry_count: u32,
}

impl smtp_queue::QueuedMail for SqlQueuedMail {
    fn id(&self) -> QueueId {
        self.id.clone()
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled
    }

    fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

pub struct SqlInflightMail {
    id: QueueId,
}

impl smtp_queue::InflightMail for SqlInflightMail {
    fn id(&self) -> QueueId {
        self.id.clone()
    }
}

pub struct SqlEnqueuer<U> {
    storage: SqlStorage<U>,
    meta: MailMetadata<U>,
    buf: Vec<u8>,
}

impl<U> AsyncWrite for SqlEnqueuer<U>
where
    U: Unpin,
{
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl<U> smtp_queue::StorageEnqueuer<SqlQueuedMail> for SqlEnqueuer<U>
where
    U: 'static + Send + Sync + Unpin + serde::Serialize,
{
    async fn commit(self) -> io::Result<SqlQueuedMail> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let from_addr = self.meta.from.as_ref().map(|e| e.to_string());
        let to_addrs = serde_json::to_string(
            &self.meta.to.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        )
        .map_err(Error::from)?;
        let meta_json = serde_json::to_string(&self.meta).map_err(Error::from)?;
        let id2 = id.clone();
        let contents = self.buf;
        run_blocking(&self.storage, move |conn| {
            conn.execute(
                "INSERT INTO smtp_queue
                     (id, status, from_addr, to_addrs, meta, contents, created_at, scheduled_at, last_attempt, retry_count)
                 VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?6, NULL, 0)",
                params![id2, from_addr, to_addrs, meta_json, contents, now.timestamp()],
            )?;
            Ok(())
        })
        .await?;
        Ok(SqlQueuedMail {
            id: QueueId::new(id),
            scheduled: now,
            last_attempt: None,
            retry_count: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_wraps_into_io_error() {
        let err = Error::Serde(serde_json::from_str::<()>("not json").unwrap_err());
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);
    }
}
