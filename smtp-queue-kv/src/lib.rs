use std::{
    future::Future,
    io,
    marker::PhantomData,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{io::AsyncWrite, prelude::*};
use redis::{Commands, Script};
use smtp_queue::{MailMetadata, QueueId};
use uuid::Uuid;

// Redis layout:
//  - `queue` is a sorted set of mail ids, scored by their scheduled-at unix
//    timestamp, used to find mails ready to be picked up.
//  - `inflight` is a plain set of mail ids currently being sent.
//  - `mail:{id}:meta` holds the JSON-encoded MailMetadata<U>.
//  - `mail:{id}:contents` holds the raw RFC5322 body.
//  - `mail:{id}:schedule` holds the JSON-encoded (at, last_attempt,
//    retry_count) triple, the only one that changes over the lifetime of a
//    queued mail.
//
// Moving a mail between `queue` and `inflight` must be atomic: two plain
// round trips (eg. a `ZREM` followed by a `SADD`) would leave the mail
// nowhere if the process crashes in between. Both directions are instead a
// single Redis-side Lua script, so the remove-and-add pair commits or not
// as one unit from Redis' point of view.

const QUEUE_KEY: &str = "smtp_queue:queue";
const INFLIGHT_KEY: &str = "smtp_queue:inflight";

/// Atomically removes `ARGV[1]` from the `queue` zset (`KEYS[1]`) and, only
/// if it was actually there, adds it to the `inflight` set (`KEYS[2]`).
/// Returns how many elements were removed from `queue` (0 or 1).
const MOVE_TO_INFLIGHT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 1 then
  redis.call('SADD', KEYS[2], ARGV[1])
end
return removed
"#;

/// Atomically removes `ARGV[1]` from the `inflight` set (`KEYS[1]`) and,
/// only if it was actually there, adds it back to the `queue` zset
/// (`KEYS[2]`) with score `ARGV[2]`. Returns how many elements were removed
/// from `inflight` (0 or 1).
const MOVE_TO_QUEUE: &str = r#"
local removed = redis.call('SREM', KEYS[1], ARGV[1])
if removed == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
end
return removed
"#;

fn meta_key(id: &str) -> String {
    format!("smtp_queue:mail:{}:meta", id)
}
fn contents_key(id: &str) -> String {
    format!("smtp_queue:mail:{}:contents", id)
}
fn schedule_key(id: &str) -> String {
    format!("smtp_queue:mail:{}:schedule", id)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

#[derive(Clone, Copy, Debug, serde::Deserialize, serde::Serialize)]
struct Schedule {
    at: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
    retry_count: u32,
}

struct KvStorageImpl<U> {
    conn: Mutex<redis::Connection>,
    phantom: PhantomData<U>,
}

pub struct KvStorage<U> {
    s: Arc<KvStorageImpl<U>>,
}

impl<U> Clone for KvStorage<U> {
    fn clone(&self) -> KvStorage<U> {
        KvStorage { s: self.s.clone() }
    }
}

impl<U> KvStorage<U> {
    pub async fn new(redis_url: &str) -> Result<KvStorage<U>, Error> {
        let url = redis_url.to_owned();
        let conn = smol::unblock(move || -> Result<redis::Connection, redis::RedisError> {
            redis::Client::open(url)?.get_connection()
        })
        .await?;
        Ok(KvStorage {
            s: Arc::new(KvStorageImpl {
                conn: Mutex::new(conn),
                phantom: PhantomData,
            }),
        })
    }
}

fn run_blocking<U, F, T>(this: &KvStorage<U>, f: F) -> impl Future<Output = Result<T, Error>>
where
    U: 'static + Send + Sync,
    F: 'static + Send + FnOnce(&mut redis::Connection) -> Result<T, Error>,
    T: 'static + Send,
{
    let this = this.clone();
    smol::unblock(move || {
        let mut conn = this.s.conn.lock().unwrap();
        f(&mut conn)
    })
}

#[async_trait]
impl<U> smtp_queue::Storage<U> for KvStorage<U>
where
    U: 'static + Send + Sync + Unpin + for<'a> serde::Deserialize<'a> + serde::Serialize,
{
    type Enqueuer = KvEnqueuer<U>;
    type InflightMail = KvInflightMail;
    type QueuedMail = KvQueuedMail;
    type Reader = futures::io::Cursor<Vec<u8>>;

    async fn list_queue(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<KvQueuedMail, (io::Error, Option<QueueId>)>>>>
    {
        let ids: Result<Vec<String>, (io::Error, Option<QueueId>)> = run_blocking(self, |conn| -> Result<Vec<String>, Error> {
            Ok(conn.zrange(QUEUE_KEY, 0, -1)?)
        })
        .await
        .map_err(|e| (io::Error::from(e), None));
        let this = self.clone();
        match ids {
            Ok(ids) => Box::pin(futures::stream::iter(ids).then(move |id| {
                let this = this.clone();
                async move { this.read_schedule(&id).await.map(|s| KvQueuedMail::new(id, s)) }
            })),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    async fn find_inflight(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<KvInflightMail, (io::Error, Option<QueueId>)>>>>
    {
        let ids: Result<Vec<String>, (io::Error, Option<QueueId>)> =
            run_blocking(self, |conn| -> Result<Vec<String>, Error> {
                Ok(conn.smembers(INFLIGHT_KEY)?)
            })
            .await
            .map_err(|e| (io::Error::from(e), None));
        match ids {
            Ok(ids) => Box::pin(futures::stream::iter(
                ids.into_iter()
                    .map(|id| Ok(KvInflightMail { id: QueueId::new(id) })),
            )),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    async fn read_inflight(
        &self,
        mail: &KvInflightMail,
    ) -> io::Result<(MailMetadata<U>, futures::io::Cursor<Vec<u8>>)> {
        let id = mail.id.0.to_string();
        let (meta_json, contents): (String, Vec<u8>) = run_blocking(self, move |conn| {
            let meta: String = conn.get(meta_key(&id))?;
            let contents: Vec<u8> = conn.get(contents_key(&id))?;
            Ok((meta, contents))
        })
        .await?;
        let meta = serde_json::from_str(&meta_json).map_err(Error::from)?;
        Ok((meta, futures::io::Cursor::new(contents)))
    }

    fn enqueue<'s, 'a>(
        &'s self,
        meta: MailMetadata<U>,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = io::Result<KvEnqueuer<U>>>>>
    where
        's: 'a,
    {
        Box::pin(async move {
            Ok(KvEnqueuer {
                storage: self.clone(),
                meta,
                buf: Vec::new(),
            })
        })
    }

    async fn reschedule(
        &self,
        mail: &mut KvQueuedMail,
        at: DateTime<Utc>,
        last_attempt: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> io::Result<()> {
        mail.scheduled = at;
        mail.last_attempt = last_attempt;
        mail.retry_count = retry_count;
        let id = mail.id.0.to_string();
        let sched = Schedule {
            at,
            last_attempt,
            retry_count,
        };
        run_blocking(self, move |conn| {
            let json = serde_json::to_string(&sched)?;
            let _: () = conn.set(schedule_key(&id), &json)?;
            let _: () = conn.zadd(QUEUE_KEY, &id, at.timestamp())?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    fn send_start<'s, 'a>(
        &'s self,
        mail: KvQueuedMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<KvInflightMail>, (KvQueuedMail, io::Error)>>,
        >,
    >
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let moved: Result<bool, Error> = run_blocking(self, move |conn| {
                let removed: i64 = Script::new(MOVE_TO_INFLIGHT)
                    .key(QUEUE_KEY)
                    .key(INFLIGHT_KEY)
                    .arg(&id)
                    .invoke(conn)?;
                Ok(removed == 1)
            })
            .await;
            match moved {
                Ok(true) => Ok(Some(KvInflightMail {
                    id: mail.id.clone(),
                })),
                Ok(false) => Ok(None),
                Err(e) => Err((mail, io::Error::from(e))),
            }
        })
    }

    fn send_done<'s, 'a>(
        &'s self,
        mail: KvInflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (KvInflightMail, io::Error)>>>>
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let result: Result<(), Error> = run_blocking(self, move |conn| {
                let _: () = conn.srem(INFLIGHT_KEY, &id)?;
                let _: () = conn.del((meta_key(&id), contents_key(&id), schedule_key(&id)))?;
                Ok(())
            })
            .await;
            result.map_err(|e| (mail, io::Error::from(e)))
        })
    }

    fn send_cancel<'s, 'a>(
        &'s self,
        mail: KvInflightMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<KvQueuedMail>, (KvInflightMail, io::Error)>>,
        >,
    >
    where
        's: 'a,
    {
        Box::pin(async move {
            let id = mail.id.0.to_string();
            let sched: Result<Option<Schedule>, Error> = run_blocking(self, move |conn| {
                let sched: String = conn.get(schedule_key(&id))?;
                let sched: Schedule = serde_json::from_str(&sched)?;
                let removed: i64 = Script::new(MOVE_TO_QUEUE)
                    .key(INFLIGHT_KEY)
                    .key(QUEUE_KEY)
                    .arg(&id)
                    .arg(sched.at.timestamp())
                    .invoke(conn)?;
                if removed == 0 {
                    return Ok(None);
                }
                Ok(Some(sched))
            })
            .await;
            match sched {
                Ok(Some(sched)) => Ok(Some(KvQueuedMail::new(mail.id.0.to_string(), sched))),
                Ok(None) => Ok(None),
                Err(e) => Err((mail, io::Error::from(e))),
            }
        })
    }
}

impl<U> KvStorage<U>
where
    U: 'static + Send + Sync,
{
    async fn read_schedule(&self, id: &str) -> Result<Schedule, (io::Error, Option<QueueId>)> {
        let id = id.to_owned();
        let id2 = id.clone();
        run_blocking(self, move |conn| {
            let json: String = conn.get(schedule_key(&id))?;
            Ok(serde_json::from_str(&json)?)
        })
        .await
        .map_err(|e| (io::Error::from(e), Some(QueueId::new(id2))))
    }
}

#[derive(Clone)]
pub struct KvQueuedMail {
    id: QueueId,
    scheduled: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
    retry_count: u32,
}

impl KvQueuedMail {
    fn new(id: String, sched: Schedule) -> KvQueuedMail {
        KvQueuedMail {
            id: QueueId::new(id),
            scheduled: sched.at,
            last_attempt: sched.last_attempt,
            retry_count: sched.retry_count,
        }
    }
}

impl smtp_queue::QueuedMail for KvQueuedMail {
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

pub struct KvInflightMail {
    id: QueueId,
}

impl smtp_queue::InflightMail for KvInflightMail {
    fn id(&self) -> QueueId {
        self.id.clone()
    }
}

pub struct KvEnqueuer<U> {
    storage: KvStorage<U>,
    meta: MailMetadata<U>,
    buf: Vec<u8>,
}

impl<U> AsyncWrite for KvEnqueuer<U>
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
impl<U> smtp_queue::StorageEnqueuer<KvQueuedMail> for KvEnqueuer<U>
where
    U: 'static + Send + Sync + serde::Serialize,
{
    async fn commit(self) -> io::Result<KvQueuedMail> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let sched = Schedule {
            at: now,
            last_attempt: None,
            retry_count: 0,
        };
        let meta_json = serde_json::to_string(&self.meta).map_err(Error::from)?;
        let sched_json = serde_json::to_string(&sched).map_err(Error::from)?;
        let id2 = id.clone();
        let contents = self.buf;
        run_blocking(&self.storage, move |conn| {
            let _: () = conn.set(meta_key(&id2), &meta_json)?;
            let _: () = conn.set(contents_key(&id2), &contents)?;
            let _: () = conn.set(schedule_key(&id2), &sched_json)?;
            let _: () = conn.zadd(QUEUE_KEY, &id2, now.timestamp())?;
            Ok(())
        })
        .await?;
        Ok(KvQueuedMail::new(id, sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_round_trips_through_json() {
        let sched = Schedule {
            at: Utc::now(),
            last_attempt: None,
            retry_count: 2,
        };
        let json = serde_json::to_string(&sched).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retry_count, 2);
    }
}
