//! Cross-crate, end-to-end behavior of the queue/retry/rate-limit pipeline.
//!
//! Ingress-level scenarios (accepting a message over SMTP, rejecting an
//! oversized body) are covered in-crate by `smtp-relay`'s own
//! `#[cfg(test)]` modules, since they need the private `ServerConfig`. This
//! crate exercises everything downstream of the queue: durable storage,
//! the forwarding worker's retry loop, rate limiting, and crash recovery.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{AsyncWriteExt, StreamExt};
use smol::Timer;

use smtp_message::Email;
use smtp_queue::{
    Config as QueueConfig, MailMetadata, QueueId, RateLimiter, RetryManager, ScheduleInfo,
    Storage, StorageEnqueuer, TokenBucketConfig, TokenBucketRateLimiter, Transport,
    TransportFailure, TransportSender,
};
use smtp_queue_sql::SqlStorage;

fn email(addr: &str) -> Email {
    Email::parse_bracketed(format!("<{}>", addr).as_bytes()).unwrap()
}

fn open_storage(path: &std::path::Path) -> Arc<SqlStorage<()>> {
    Arc::new(smol::block_on(SqlStorage::new(path)).expect("opening the sqlite queue backend"))
}

async fn enqueue(storage: &SqlStorage<()>, from: &str, to: &[&str], body: &[u8]) {
    let meta = MailMetadata {
        user: (),
        from: Some(email(from)),
        to: to.iter().map(|a| email(a)).collect(),
    };
    let mut enqueuer = storage.enqueue(meta).await.unwrap();
    enqueuer.write_all(body).await.unwrap();
    enqueuer.commit().await.unwrap();
}

/// A `Config` with negligible logging overhead and a short inflight-recovery
/// interval, so tests don't have to wait on production-scale timers.
struct TestQueueConfig;

#[async_trait]
impl QueueConfig<(), std::io::Error> for TestQueueConfig {
    async fn next_interval(&self, _s: ScheduleInfo) -> Option<Duration> {
        None
    }

    async fn log_storage_error(&self, err: std::io::Error, id: Option<QueueId>) {
        panic!("unexpected storage error for {:?}: {}", id, err);
    }

    async fn log_found_inflight(&self, _inflight: QueueId) {}

    async fn log_found_pending_cleanup(&self, _pcm: QueueId) {}

    async fn log_queued_mail_vanished(&self, _id: QueueId) {}

    async fn log_inflight_mail_vanished(&self, _id: QueueId) {}

    async fn log_pending_cleanup_mail_vanished(&self, _id: QueueId) {}

    async fn log_too_big_duration(&self, _id: QueueId, _too_big: Duration, _new: Duration) {}

    fn found_inflight_check_delay(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// Replays a scripted sequence of outcomes, one per `send` call, repeating
/// the last entry once the script is exhausted. Records the wall-clock time
/// of every attempt.
struct ScriptedTransportState {
    outcomes: Mutex<VecDeque<Result<(), TransportFailure>>>,
    attempts: AtomicUsize,
    timestamps: Mutex<Vec<chrono::DateTime<Utc>>>,
}

/// Thin, cheaply-`Clone`-able handle around the shared state, mirroring the
/// `Arc`-backed-impl newtype pattern `KvStorage`/`SqlStorage` already use:
/// `connect(&self)` only has a borrow, but `ScriptedSender` must be
/// `'static`, so the shared state lives behind its own `Arc`.
struct ScriptedTransport(Arc<ScriptedTransportState>);

impl ScriptedTransport {
    fn new(outcomes: Vec<Result<(), TransportFailure>>) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport(Arc::new(ScriptedTransportState {
            outcomes: Mutex::new(outcomes.into()),
            attempts: AtomicUsize::new(0),
            timestamps: Mutex::new(Vec::new()),
        })))
    }

    fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    fn timestamps(&self) -> Vec<chrono::DateTime<Utc>> {
        self.0.timestamps.lock().unwrap().clone()
    }
}

struct ScriptedSender(Arc<ScriptedTransportState>);

#[async_trait]
impl Transport<()> for ScriptedTransport {
    type Sender = ScriptedSender;

    async fn connect(&self) -> Result<Self::Sender, TransportFailure> {
        Ok(ScriptedSender(self.0.clone()))
    }
}

#[async_trait]
impl TransportSender<()> for ScriptedSender {
    async fn send<Reader>(
        &mut self,
        _meta: &MailMetadata<()>,
        _mail: Reader,
    ) -> Result<(), TransportFailure>
    where
        Reader: 'static + Send + futures::AsyncRead + Unpin,
    {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        self.0.timestamps.lock().unwrap().push(Utc::now());
        let mut outcomes = self.0.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            *outcomes.front().expect("script must have at least one outcome")
        }
    }
}

fn tmp_sqlite_path(name: &str) -> (tempdir::TempDir, std::path::PathBuf) {
    let dir = tempdir::TempDir::new("smtp-relay-integration").unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn transient_failure_then_recover() {
    let (_dir, path) = tmp_sqlite_path("queue.sqlite3");
    let storage = open_storage(&path);
    smol::block_on(enqueue(&storage, "a@x", &["b@y"], b"Subject: hi\r\n\r\nhello"));

    let transport = ScriptedTransport::new(vec![
        Err(TransportFailure::NetworkTransient),
        Err(TransportFailure::NetworkTransient),
        Ok(()),
    ]);
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketRateLimiter::new(TokenBucketConfig {
        max_tokens: 100.0,
        tokens_per_second: 100.0,
    }));
    let retry = RetryManager::new(Duration::from_secs(1), 3);
    let config = Arc::new(TestQueueConfig);

    let started_at = Utc::now();
    smol::block_on(async {
        let handle = smol::spawn(smtp_queue::run(
            storage.clone(),
            config,
            transport.clone(),
            rate_limiter,
            retry,
        ));
        for _ in 0..100 {
            if transport.attempts() >= 3 {
                break;
            }
            Timer::after(Duration::from_millis(100)).await;
        }
        drop(handle);
    });

    assert_eq!(transport.attempts(), 3);
    let elapsed = (Utc::now() - started_at).num_milliseconds();
    assert!(
        elapsed >= 3000,
        "expected at least 1s + 2s of backoff before the third attempt, elapsed {}ms",
        elapsed
    );
}

#[test]
fn exceeds_retry_budget_gives_up() {
    let (_dir, path) = tmp_sqlite_path("queue.sqlite3");
    let storage = open_storage(&path);
    smol::block_on(enqueue(&storage, "a@x", &["b@y"], b"Subject: hi\r\n\r\nhello"));

    let transport = ScriptedTransport::new(vec![Err(TransportFailure::NetworkTransient)]);
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketRateLimiter::new(TokenBucketConfig {
        max_tokens: 100.0,
        tokens_per_second: 100.0,
    }));
    let retry = RetryManager::new(Duration::from_millis(50), 2);
    let config = Arc::new(TestQueueConfig);

    smol::block_on(async {
        let handle = smol::spawn(smtp_queue::run(
            storage.clone(),
            config,
            transport.clone(),
            rate_limiter,
            retry,
        ));
        for _ in 0..100 {
            if transport.attempts() >= 3 {
                break;
            }
            Timer::after(Duration::from_millis(50)).await;
        }
        // give the worker a chance to make a 4th attempt if it wrongly kept retrying
        Timer::after(Duration::from_millis(300)).await;
        drop(handle);
    });

    assert_eq!(
        transport.attempts(),
        3,
        "base attempt + 2 retries, then give up"
    );
    let remaining = smol::block_on(async {
        let mut queue = storage.list_queue().await;
        let mut n = 0;
        while queue.next().await.is_some() {
            n += 1;
        }
        n
    });
    assert_eq!(remaining, 0, "the given-up mail must be removed from the queue");
}

#[test]
fn rate_limit_shapes_throughput() {
    let (_dir, path) = tmp_sqlite_path("queue.sqlite3");
    let storage = open_storage(&path);
    smol::block_on(async {
        for i in 0..10 {
            enqueue(&storage, "a@x", &[&format!("b{}@y", i)], b"Subject: hi\r\n\r\nhello").await;
        }
    });

    let transport = ScriptedTransport::new(vec![Ok(())]);
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketRateLimiter::new(TokenBucketConfig {
        max_tokens: 1.0,
        tokens_per_second: 2.0,
    }));
    let retry = RetryManager::new(Duration::from_secs(1), 3);
    let config = Arc::new(TestQueueConfig);

    smol::block_on(async {
        let handle = smol::spawn(smtp_queue::run(
            storage.clone(),
            config,
            transport.clone(),
            rate_limiter,
            retry,
        ));
        for _ in 0..200 {
            if transport.attempts() >= 10 {
                break;
            }
            Timer::after(Duration::from_millis(50)).await;
        }
        drop(handle);
    });

    let timestamps = transport.timestamps();
    assert_eq!(timestamps.len(), 10);
    for pair in timestamps.windows(2).skip(1) {
        let gap_ms = (pair[1] - pair[0]).num_milliseconds();
        assert!(
            gap_ms >= 450,
            "expected >= ~0.5s between sends once the bucket is drained, got {}ms",
            gap_ms
        );
    }
}

#[test]
fn crash_recovery_resends_at_least_once() {
    let (_dir, path) = tmp_sqlite_path("queue.sqlite3");

    // First "process": enqueue a mail, then pull it inflight but never settle
    // it, simulating a crash between send_start and send_done/send_cancel.
    {
        let storage = open_storage(&path);
        smol::block_on(async {
            enqueue(&storage, "a@x", &["b@y"], b"Subject: hi\r\n\r\nhello").await;
            let mut queue = storage.list_queue().await;
            let mail = queue.next().await.unwrap().unwrap();
            drop(queue);
            match storage.send_start(mail).await {
                Ok(Some(_inflight)) => {}
                Ok(None) => panic!("mail must still be present"),
                Err((_, e)) => panic!("pulling the mail inflight: {}", e),
            }
        });

        let inflight_count = smol::block_on(async {
            let mut inflight = storage.find_inflight().await;
            let mut n = 0;
            while inflight.next().await.is_some() {
                n += 1;
            }
            n
        });
        assert_eq!(inflight_count, 1);
    }

    // Second "process": a fresh storage handle over the same file, as after
    // a restart. `recover_inflight` should move the mail back to "queued"
    // before the worker loop picks it up again.
    let storage = open_storage(&path);
    let transport = ScriptedTransport::new(vec![Ok(())]);
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketRateLimiter::new(TokenBucketConfig {
        max_tokens: 100.0,
        tokens_per_second: 100.0,
    }));
    let retry = RetryManager::new(Duration::from_secs(1), 3);
    let config = Arc::new(TestQueueConfig);

    smol::block_on(async {
        let handle = smol::spawn(smtp_queue::run(
            storage.clone(),
            config,
            transport.clone(),
            rate_limiter,
            retry,
        ));
        for _ in 0..100 {
            if transport.attempts() >= 1 {
                break;
            }
            Timer::after(Duration::from_millis(100)).await;
        }
        drop(handle);
    });

    assert_eq!(transport.attempts(), 1, "the recovered mail must be resent exactly once");
}
