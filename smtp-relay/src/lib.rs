use std::{io, sync::Arc, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use smol::{future::FutureExt, unblock};
use tracing::{debug, error, info};

mod client_config;
mod config;
mod queue_config;
mod queue_transport;
mod server_config;
mod storage;

pub use config::Settings;

use client_config::ClientConfig;
use queue_config::QueueConfig;
use queue_transport::QueueTransport;
use server_config::ServerConfig;
use storage::AnyStorage;

use config::{LogFormat, QueueBackend, RateLimitStrategy};

fn init_logging(log: &config::LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
    }
}

async fn build_storage(cfg: &config::QueueConfigSection) -> anyhow::Result<AnyStorage> {
    match cfg.backend {
        QueueBackend::Kvstore => {
            let storage = smtp_queue_kv::KvStorage::new(&cfg.kvstore_url)
                .await
                .context("connecting to the kvstore queue backend")?;
            Ok(AnyStorage::Kv(storage))
        }
        QueueBackend::Sql => {
            let storage = smtp_queue_sql::SqlStorage::new(&cfg.sql_path)
                .await
                .context("opening the sql queue backend")?;
            Ok(AnyStorage::Sql(storage))
        }
    }
}

fn build_rate_limiter(cfg: &config::RateLimitConfig) -> Arc<dyn smtp_queue::RateLimiter> {
    use smtp_queue::{
        CompositeRateLimiter, FixedWindowConfig, FixedWindowRateLimiter, LeakyBucketConfig,
        LeakyBucketRateLimiter, TokenBucketConfig, TokenBucketRateLimiter,
    };

    let token_bucket = || {
        Box::new(TokenBucketRateLimiter::new(TokenBucketConfig {
            max_tokens: cfg.capacity,
            tokens_per_second: cfg.refill_rate,
        })) as Box<dyn smtp_queue::RateLimiter>
    };
    let fixed_window = || {
        Box::new(FixedWindowRateLimiter::new(FixedWindowConfig {
            window: Duration::from_secs(cfg.window_seconds),
            requests_per_window: cfg.limit,
        })) as Box<dyn smtp_queue::RateLimiter>
    };
    let leaky_bucket = || {
        Box::new(LeakyBucketRateLimiter::new(LeakyBucketConfig {
            bucket_capacity: cfg.bucket_capacity,
            leak_rate: cfg.leak_rate,
        })) as Box<dyn smtp_queue::RateLimiter>
    };

    match cfg.strategy {
        RateLimitStrategy::TokenBucket => {
            Arc::from(token_bucket()) as Arc<dyn smtp_queue::RateLimiter>
        }
        RateLimitStrategy::FixedWindow => Arc::from(fixed_window()),
        RateLimitStrategy::LeakyBucket => Arc::from(leaky_bucket()),
        RateLimitStrategy::Composite => {
            let mut limiters: Vec<Box<dyn smtp_queue::RateLimiter>> = Vec::new();
            if cfg.enable_token_bucket {
                limiters.push(token_bucket());
            }
            if cfg.enable_fixed_window {
                limiters.push(fixed_window());
            }
            if cfg.enable_leaky_bucket {
                limiters.push(leaky_bucket());
            }
            if limiters.is_empty() {
                limiters.push(token_bucket());
            }
            Arc::new(CompositeRateLimiter::new(limiters))
        }
    }
}

fn load_server_tls(smtp: &config::SmtpConfig) -> anyhow::Result<async_tls::TlsAcceptor> {
    let cert_file = smtp.tls_cert_file.clone();
    let key_file = smtp.tls_key_file.clone();

    let certs = rustls_pemfile::certs(&mut io::BufReader::new(
        std::fs::File::open(&cert_file)
            .with_context(|| format!("opening the certificate file '{}'", cert_file))?,
    ))
    .with_context(|| format!("parsing the TLS certificate file '{}'", cert_file))?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();
    debug!(num_certs = certs.len(), "parsed TLS certificates");

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut io::BufReader::new(
        std::fs::File::open(&key_file)
            .with_context(|| format!("opening the key file '{}'", key_file))?,
    ))
    .with_context(|| format!("parsing the TLS key file '{}'", key_file))?;
    anyhow::ensure!(
        keys.len() == 1,
        "key file '{}' did not have exactly one key, had {}",
        key_file,
        keys.len()
    );
    let key = rustls::PrivateKey(keys.remove(0));

    let mut tls_server_cfg = rustls::ServerConfig::new(rustls::NoClientAuth::new());
    tls_server_cfg
        .set_single_cert(certs, key)
        .context("setting the TLS certificate and key")?;

    Ok(async_tls::TlsAcceptor::from(tls_server_cfg))
}

fn build_client_connector() -> async_tls::TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
    let mut tls_client_cfg = rustls::ClientConfig::new();
    tls_client_cfg.root_store = root_store;
    async_tls::TlsConnector::from(tls_client_cfg)
}

/// Runs the relay until `shutdown` fires: recovers the queue, spawns the
/// forwarding worker and the ingress accept loop, and waits.
pub fn run(settings: Settings, shutdown: smol::channel::Receiver<()>) -> anyhow::Result<()> {
    init_logging(&settings.log);
    info!("smtp-relay starting up");

    let ex = Arc::new(smol::Executor::new());

    smol::block_on(ex.run(async {
        let storage = Arc::new(
            build_storage(&settings.queue)
                .await
                .context("preparing the queue storage")?,
        );

        let connector = build_client_connector();
        let client_config = Arc::new(ClientConfig::new(connector, &settings.target_smtp));
        let client = smtp_client::Client::new(client_config);
        let destination = smtp_client::Destination {
            host: settings.target_smtp.host.clone(),
            port: settings.target_smtp.port,
        };
        let transport = Arc::new(QueueTransport::new(client, destination));
        let shutdown_transport = transport.clone();

        let queue_config = Arc::new(QueueConfig::new(Duration::from_secs(
            settings.rate_limit.retry_delay_base_seconds,
        )));
        let rate_limiter = build_rate_limiter(&settings.rate_limit);
        let retry = smtp_queue::RetryManager::new(
            Duration::from_secs(settings.rate_limit.retry_delay_base_seconds),
            settings.rate_limit.max_retries,
        );

        let worker_storage = storage.clone();
        let worker = ex.spawn(smtp_queue::run(
            worker_storage,
            queue_config,
            transport,
            rate_limiter,
            retry,
        ));

        let acceptor = unblock({
            let smtp = settings.smtp.clone();
            move || load_server_tls(&smtp)
        })
        .await
        .context("preparing the ingress TLS configuration")?;

        let server_cfg = Arc::new(ServerConfig::new(acceptor, (*storage).clone(), settings.smtp.clone()));

        let bind_addr = format!("{}:{}", settings.smtp.local_host, settings.smtp.local_port);
        let listener = smol::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding on '{}'", bind_addr))?;
        let mut incoming = listener.incoming();

        info!(addr = %bind_addr, "ingress server up, waiting for connections");

        let accept_loop = async {
            loop {
                match incoming.next().await {
                    Some(Ok(stream)) => {
                        let server_cfg = server_cfg.clone();
                        ex.spawn(async move {
                            if let Err(e) =
                                smtp_server::interact(stream, smtp_server::IsAlreadyTls::No, (), server_cfg)
                                    .await
                            {
                                error!(error = ?e, "error while handling an ingress connection");
                            }
                        })
                        .detach();
                    }
                    Some(Err(e)) => {
                        error!(error = ?e, "error accepting an incoming connection");
                    }
                    None => break,
                }
            }
            Ok::<(), anyhow::Error>(())
        };

        accept_loop
            .or(async {
                shutdown
                    .recv()
                    .await
                    .context("receiving the shutdown notification")?;
                info!("shutdown requested, stopping the ingress accept loop");
                Ok(())
            })
            .await?;

        std::mem::drop(worker);
        shutdown_transport.close().await;

        Ok(())
    }))
}
