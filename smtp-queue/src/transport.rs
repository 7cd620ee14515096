use async_trait::async_trait;
use futures::io::AsyncRead;

use crate::MailMetadata;

/// Severity-classified outcome of a delivery attempt, independent of the
/// concrete transport used to reach the upstream server.
///
/// `Local` indicates a problem on our end (eg. failed to even open a
/// connection); the other variants mirror the SMTP reply classes so that the
/// retry manager can decide whether, and how long, to wait before trying
/// again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransportFailure {
    #[error("local error")]
    Local,
    #[error("transient network error")]
    NetworkTransient,
    #[error("transient mail error")]
    MailTransient,
    #[error("transient mailbox error")]
    MailboxTransient,
    #[error("transient mail system error")]
    MailSystemTransient,
    #[error("permanent mail error")]
    MailPermanent,
    #[error("permanent mailbox error")]
    MailboxPermanent,
    #[error("permanent mail system error")]
    MailSystemPermanent,
}

impl TransportFailure {
    /// Whether this failure is worth retrying at all, as opposed to being a
    /// permanent rejection of the message.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            TransportFailure::MailPermanent
                | TransportFailure::MailboxPermanent
                | TransportFailure::MailSystemPermanent
        )
    }
}

/// Abstracts away how a connection to the upstream server is obtained, so
/// that the queue worker doesn't need to know about DNS, TLS or even SMTP
/// itself.
#[async_trait]
pub trait Transport<U>: 'static + Send + Sync
where
    U: 'static + Send + Sync,
{
    type Sender: TransportSender<U>;

    /// Opens a connection (and, where applicable, performs the SMTP
    /// handshake) to the single configured upstream.
    async fn connect(&self) -> Result<Self::Sender, TransportFailure>;
}

/// A connection to the upstream server, ready to send one message.
#[async_trait]
pub trait TransportSender<U>: 'static + Send
where
    U: 'static + Send + Sync,
{
    async fn send<Reader>(
        &mut self,
        meta: &MailMetadata<U>,
        mail: Reader,
    ) -> Result<(), TransportFailure>
    where
        Reader: 'static + Send + AsyncRead + Unpin;
}
