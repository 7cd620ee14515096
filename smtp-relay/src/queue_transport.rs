use std::sync::Arc;

use async_trait::async_trait;
use futures::AsyncRead;
use tracing::{info, warn};

use crate::client_config::ClientConfig;

fn transport_error_client_to_queue(
    err: smtp_client::TransportError,
    text: &'static str,
) -> smtp_queue::TransportFailure {
    let severity = err.severity();
    warn!(error = ?err, "{}", text);
    match severity {
        smtp_client::TransportErrorSeverity::Local => smtp_queue::TransportFailure::Local,
        smtp_client::TransportErrorSeverity::NetworkTransient => {
            smtp_queue::TransportFailure::NetworkTransient
        }
        smtp_client::TransportErrorSeverity::MailTransient => {
            smtp_queue::TransportFailure::MailTransient
        }
        smtp_client::TransportErrorSeverity::MailboxTransient => {
            smtp_queue::TransportFailure::MailboxTransient
        }
        smtp_client::TransportErrorSeverity::MailSystemTransient => {
            smtp_queue::TransportFailure::MailSystemTransient
        }
        smtp_client::TransportErrorSeverity::MailPermanent => {
            smtp_queue::TransportFailure::MailPermanent
        }
        smtp_client::TransportErrorSeverity::MailboxPermanent => {
            smtp_queue::TransportFailure::MailboxPermanent
        }
        smtp_client::TransportErrorSeverity::MailSystemPermanent => {
            smtp_queue::TransportFailure::MailSystemPermanent
        }
    }
}

struct QueueTransportShared {
    client: smtp_client::Client<ClientConfig>,
    destination: smtp_client::Destination,
    /// The connection this worker is currently holding open, if any. Taken
    /// out by `connect()` and put back by `send()` on success, so that a
    /// single TCP+TLS handshake serves every mail the worker sends until a
    /// transport error forces a reconnect.
    cached: smol::lock::Mutex<Option<smtp_client::Sender<ClientConfig>>>,
}

/// Forwards every mail to the single configured `target_smtp` upstream,
/// reusing one persistent connection per worker rather than reconnecting on
/// every send. There is no MX lookup: the destination is fixed at startup.
pub struct QueueTransport(Arc<QueueTransportShared>);

impl QueueTransport {
    pub fn new(
        client: smtp_client::Client<ClientConfig>,
        destination: smtp_client::Destination,
    ) -> QueueTransport {
        QueueTransport(Arc::new(QueueTransportShared {
            client,
            destination,
            cached: smol::lock::Mutex::new(None),
        }))
    }

    /// Sends `QUIT` on the currently-held connection, if any, and drops it.
    /// Meant to be called once, from the shutdown path, after the worker
    /// loop has stopped making delivery attempts.
    pub async fn close(&self) {
        if let Some(mut sender) = self.0.cached.lock().await.take() {
            sender.quit().await;
        }
    }
}

#[async_trait]
impl smtp_queue::Transport<()> for QueueTransport {
    type Sender = QueueTransportSender;

    async fn connect(&self) -> Result<Self::Sender, smtp_queue::TransportFailure> {
        if let Some(sender) = self.0.cached.lock().await.take() {
            return Ok(QueueTransportSender {
                shared: self.0.clone(),
                sender: Some(sender),
            });
        }

        info!(destination = %self.0.destination, "connecting to upstream relay");
        let sender = self
            .0
            .client
            .connect(&self.0.destination)
            .await
            .map_err(|e| {
                transport_error_client_to_queue(e, "transport error while connecting upstream")
            })?;
        Ok(QueueTransportSender {
            shared: self.0.clone(),
            sender: Some(sender),
        })
    }
}

pub struct QueueTransportSender {
    shared: Arc<QueueTransportShared>,
    sender: Option<smtp_client::Sender<ClientConfig>>,
}

#[async_trait]
impl smtp_queue::TransportSender<()> for QueueTransportSender {
    async fn send<Reader>(
        &mut self,
        meta: &smtp_queue::MailMetadata<()>,
        mail: Reader,
    ) -> Result<(), smtp_queue::TransportFailure>
    where
        Reader: 'static + Send + AsyncRead + Unpin,
    {
        let mut sender = self
            .sender
            .take()
            .expect("QueueTransportSender::send called more than once per connect()");
        let result = sender.send(meta.from.as_ref(), &meta.to, mail).await;
        match result {
            Ok(()) => {
                // Keep the connection around for the next send; any error
                // below leaves the cache empty, forcing a fresh connect().
                *self.shared.cached.lock().await = Some(sender);
                Ok(())
            }
            Err(e) => {
                Err(transport_error_client_to_queue(e, "transport error while sending mail"))
            }
        }
    }
}
