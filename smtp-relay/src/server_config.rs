use std::{borrow::Cow, io, pin::Pin};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, warn};

use smtp_message::{Email, EnhancedReplyCode, EscapedDataReader, MaybeUtf8, Message, Reply, ReplyCode};
use smtp_queue::{MailMetadata as QueueMailMetadata, Storage};
use smtp_server::{ConnectionMetadata, Decision, MailMetadata};

use crate::{config::SmtpConfig, storage::AnyStorage};

/// Ingress-side SMTP server: validates envelopes, enforces the configured
/// size limit and optional AUTH, and hands accepted mail over to the queue.
pub struct ServerConfig {
    acceptor: async_tls::TlsAcceptor,
    storage: AnyStorage,
    smtp: SmtpConfig,
}

impl ServerConfig {
    pub fn new(acceptor: async_tls::TlsAcceptor, storage: AnyStorage, smtp: SmtpConfig) -> ServerConfig {
        ServerConfig {
            acceptor,
            storage,
            smtp,
        }
    }

    fn credentials_match(&self, user: &str, password: &str) -> bool {
        let (expect_user, expect_password) =
            match (&self.smtp.auth_username, &self.smtp.auth_password) {
                (Some(u), Some(p)) => (u, p),
                _ => return false,
            };
        constant_time_eq(user.as_bytes(), expect_user.as_bytes())
            && constant_time_eq(password.as_bytes(), expect_password.as_bytes())
    }

    fn invalid_data(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::MAILBOX_UNAVAILABLE,
            ecode: Some(EnhancedReplyCode::PERMANENT_MAILBOX_UNAVAILABLE.into()),
            text: vec![MaybeUtf8::Utf8("Invalid data".into())],
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[async_trait]
impl smtp_server::Config for ServerConfig {
    type ConnectionUserMeta = ();
    type MailUserMeta = ();

    fn hostname(&self) -> Cow<'static, str> {
        self.smtp.local_host.clone().into()
    }

    fn auth_required(&self) -> bool {
        self.smtp.auth_required
    }

    async fn handle_auth(
        &self,
        user: &str,
        password: &str,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        if self.credentials_match(user, password) {
            Decision::Accept
        } else {
            Decision::Reject(self.auth_credentials_invalid())
        }
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<()>) {}

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<()>) -> bool {
        !conn_meta.is_encrypted
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<
        duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let io = self.acceptor.accept(io).await?;
        let (r, w) = io.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        from: &mut Option<Email<&str>>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        if from.as_ref().map(|f| f.hostname.is_none()).unwrap_or(false) {
            return Decision::Reject(self.invalid_data());
        }
        Decision::Accept
    }

    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        if to.hostname.is_none() {
            return Decision::Reject(self.invalid_data());
        }
        Decision::Accept
    }

    /// Streams the DATA block into memory (capped at `max_message_size`),
    /// reparses it into a `Message`, and enqueues it in a single commit.
    async fn handle_mail<'a, R>(
        &self,
        stream: &mut EscapedDataReader<'a, R>,
        meta: MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let mut data = Vec::new();
        let limit = self.smtp.max_message_size;
        let mut buf = [0; 16 * 1024];
        let mut too_big = false;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !too_big {
                        if data.len() + n > limit {
                            too_big = true;
                        } else {
                            data.extend_from_slice(&buf[..n]);
                        }
                    }
                }
                Err(e) => {
                    error!(error = ?e, "error reading DATA from client");
                    return Decision::Reject(self.internal_server_error());
                }
            }
        }

        if !stream.is_finished() {
            error!("DATA stream stopped without completing");
            return Decision::Reject(self.internal_server_error());
        }
        stream.complete();

        if too_big {
            warn!(limit, "rejecting oversized message");
            return Decision::Reject(self.invalid_data());
        }

        let from_addr = meta
            .from
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        let to_addrs: Vec<String> = meta.to.iter().map(|e| e.to_string()).collect();
        let message = Message::parse(&from_addr, &to_addrs, &data);
        let serialized = match message.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = ?e, "failed serializing accepted message");
                return Decision::Reject(self.invalid_data());
            }
        };

        let queue_meta = QueueMailMetadata {
            user: (),
            from: meta.from,
            to: meta.to,
        };
        let mut enqueuer = match self.storage.enqueue(queue_meta).await {
            Ok(enqueuer) => enqueuer,
            Err(e) => {
                error!(error = ?e, "failed opening queue enqueuer");
                return Decision::Reject(self.internal_server_error());
            }
        };
        if let Err(e) = enqueuer.write_all(&serialized).await {
            error!(error = ?e, "failed writing mail to queue");
            return Decision::Reject(self.internal_server_error());
        }
        if let Err(e) = enqueuer.commit().await {
            error!(error = ?e, "failed committing mail to queue");
            return Decision::Reject(self.internal_server_error());
        }

        Decision::Accept
    }
}
