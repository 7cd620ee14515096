mod config;
mod ratelimit;
mod retry;
mod run;
mod storage;
mod transport;

pub use config::Config;
pub use ratelimit::{
    CompositeRateLimiter, FixedWindowConfig, FixedWindowRateLimiter, LeakyBucketConfig,
    LeakyBucketRateLimiter, RateLimiter, TokenBucketConfig, TokenBucketRateLimiter,
};
pub use retry::RetryManager;
pub use run::run;
pub use storage::{InflightMail, QueuedMail, Storage, StorageEnqueuer};
pub use transport::{Transport, TransportFailure, TransportSender};

pub use smtp_queue_types::{QueueId, ScheduleInfo};

use smtp_message::Email;

/// Per-mail metadata the queue itself needs, independent of whatever
/// connection-level metadata type `U` the embedding application attaches.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct MailMetadata<U> {
    pub user: U,
    pub from: Option<Email>,
    pub to: Vec<Email>,
}
