use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{io::AsyncReadExt, prelude::*};

use crate::{
    config::Config,
    ratelimit::RateLimiter,
    retry::RetryManager,
    storage::{InflightMail, QueuedMail, Storage},
    transport::Transport,
};

/// Runs the forwarding worker forever: recovers mails left inflight by a
/// previous run, then repeatedly pulls ready mails off the queue, respecting
/// the rate limiter, and attempts delivery through `transport`.
///
/// This does not return under normal operation; callers typically
/// `smol::spawn` it alongside the ingress server.
pub async fn run<U, S, C, T>(
    storage: Arc<S>,
    config: Arc<C>,
    transport: Arc<T>,
    rate_limiter: Arc<dyn RateLimiter>,
    retry: RetryManager,
) where
    U: 'static + Send + Sync,
    S: Storage<U>,
    C: Config<U, std::io::Error>,
    T: Transport<U>,
{
    recover_inflight(&storage, &config).await;

    loop {
        rate_limiter.acquire().await;

        match next_ready_mail(&storage, &config).await {
            Some(mail) => {
                if let Err(err) =
                    attempt_delivery(&storage, &config, &transport, &retry, mail).await
                {
                    tracing::warn!(error = ?err, "storage error while attempting delivery");
                }
            }
            None => {
                smol::Timer::after(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Moves every mail found inflight at startup back to the queue. A previous
/// process may have crashed mid-delivery, so these are not trusted to still
/// be genuinely in flight. This runs once, immediately, before the first
/// delivery attempt; `Config::found_inflight_check_delay` governs periodic
/// rescans performed by long-lived deployments layering their own scan loop
/// on top of this storage, not this initial pass.
async fn recover_inflight<U, S, C>(storage: &Arc<S>, config: &Arc<C>)
where
    U: 'static + Send + Sync,
    S: Storage<U>,
    C: Config<U, std::io::Error>,
{
    let mut inflight = storage.find_inflight().await;
    while let Some(found) = inflight.next().await {
        match found {
            Ok(mail) => {
                let id = mail.id();
                config.log_found_inflight(id.clone()).await;
                match storage.send_cancel(mail).await {
                    Ok(Some(_)) => {}
                    Ok(None) => config.log_inflight_mail_vanished(id).await,
                    Err((_, err)) => config.log_storage_error(err, Some(id)).await,
                }
            }
            Err((err, id)) => config.log_storage_error(err, id).await,
        }
    }
}

/// Scans the queue for the first mail whose schedule has come due.
async fn next_ready_mail<U, S, C>(storage: &Arc<S>, config: &Arc<C>) -> Option<S::QueuedMail>
where
    U: 'static + Send + Sync,
    S: Storage<U>,
    C: Config<U, std::io::Error>,
{
    let mut queue = storage.list_queue().await;
    let now = Utc::now();
    while let Some(found) = queue.next().await {
        match found {
            Ok(mail) if mail.scheduled_at() <= now => return Some(mail),
            Ok(_) => continue,
            Err((err, id)) => config.log_storage_error(err, id).await,
        }
    }
    None
}

async fn attempt_delivery<U, S, C, T>(
    storage: &Arc<S>,
    config: &Arc<C>,
    transport: &Arc<T>,
    retry: &RetryManager,
    mail: S::QueuedMail,
) -> std::io::Result<()>
where
    U: 'static + Send + Sync,
    S: Storage<U>,
    C: Config<U, std::io::Error>,
    T: Transport<U>,
{
    let retry_count = mail.retry_count();
    let inflight = match storage.send_start(mail).await {
        Ok(Some(inflight)) => inflight,
        Ok(None) => return Ok(()),
        Err((_, err)) => return Err(err),
    };
    let id = inflight.id();

    let (meta, mut reader) = match storage.read_inflight(&inflight).await {
        Ok(v) => v,
        Err(err) => {
            config
                .log_storage_error(err, Some(id.clone()))
                .await;
            storage
                .send_cancel(inflight)
                .await
                .map_err(|(_, err)| err)?;
            return Ok(());
        }
    };

    // The whole body is read up front so that it can be replayed on every
    // retry attempt the loop below makes: `Storage::Reader` is a one-shot
    // stream, but the connection/backoff loop needs a fresh copy each time.
    let mut body = Vec::new();
    if let Err(err) = reader.read_to_end(&mut body).await {
        config.log_storage_error(err, Some(id.clone())).await;
        storage
            .send_cancel(inflight)
            .await
            .map_err(|(_, err)| err)?;
        return Ok(());
    }

    let mut final_retry_count = retry_count;
    let mut last_attempt = None;
    let outcome = retry
        .send(&**transport, &meta, body, &mut final_retry_count, &mut last_attempt)
        .await;

    match outcome {
        Ok(()) => {
            storage.send_done(inflight).await.map_err(|(_, err)| err)?;
        }
        Err(failure) => {
            tracing::warn!(?failure, retry_count = final_retry_count, "giving up on mail delivery");
            storage.send_done(inflight).await.map_err(|(_, err)| err)?;
        }
    }

    Ok(())
}
