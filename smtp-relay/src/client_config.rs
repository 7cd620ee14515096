use std::{io, pin::Pin};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite};

use smtp_message::Hostname;

use crate::config::TargetSmtpConfig;

pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

/// Configures the single upstream connection the forwarding worker dials.
pub struct ClientConfig {
    connector: async_tls::TlsConnector,
    target_host: String,
    use_tls: bool,
    credentials: Option<(String, String)>,
}

impl ClientConfig {
    pub fn new(connector: async_tls::TlsConnector, target: &TargetSmtpConfig) -> ClientConfig {
        let credentials = match (&target.username, &target.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        ClientConfig {
            connector,
            target_host: target.host.clone(),
            use_tls: target.use_tls,
            credentials,
        }
    }
}

#[async_trait]
impl smtp_client::Config for ClientConfig {
    fn ehlo_hostname(&self) -> Hostname<String> {
        Hostname::AsciiDomain {
            raw: "localhost".to_owned(),
        }
    }

    fn can_do_tls(&self) -> bool {
        self.use_tls
    }

    fn must_do_tls(&self) -> bool {
        self.use_tls
    }

    fn implicit_tls(&self) -> bool {
        self.use_tls
    }

    fn auth_credentials(&self) -> Option<(String, String)> {
        self.credentials.clone()
    }

    async fn tls_connect<IO>(&self, io: IO) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let io = self.connector.connect(&self.target_host, io).await?;
        let (r, w) = io.split();
        let io = duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        Ok(io)
    }
}
