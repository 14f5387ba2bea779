//! Receiving side: accepts connections, reads one message from each and applies it to the
//! destination root.

use anyhow::Context;
use common::resolve::{Resolution, Resolver};
use remote::protocol::Header;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory all received files are stored in
    pub root: std::path::PathBuf,
    pub limits: common::MessageLimits,
    /// Longest wait for the next byte from a peer
    pub idle_timeout: std::time::Duration,
    pub max_connections: usize,
    /// Remove the stored file when a delete notice arrives instead of only logging it
    pub propagate_deletes: bool,
}

/// Result of handling one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored(Resolution),
    /// Delete notice logged, nothing on disk changed.
    DeleteNoticed,
    /// Delete notice applied; `false` if there was no such file.
    Removed(bool),
}

fn record(resolution: &Resolution, size: u64) {
    let stats = common::get_stats();
    match resolution {
        Resolution::Created => stats.files_created.inc(),
        Resolution::Unchanged => stats.files_unchanged.inc(),
        Resolution::Versioned { .. } => stats.files_versioned.inc(),
    }
    stats.bytes_transferred.add(size);
}

/// Reads a single message from `stream` and applies it.
///
/// Nothing is written unless the whole message arrived and passed validation.
pub async fn handle_connection<R: tokio::io::AsyncRead + Unpin>(
    stream: R,
    resolver: &Resolver,
    settings: &Settings,
) -> anyhow::Result<Outcome> {
    let mut recv_stream =
        remote::streams::RecvStream::new(stream, settings.limits, settings.idle_timeout);
    match recv_stream.recv_header().await? {
        Header::Upload { name } => {
            // reject bad names before buffering the body
            resolver.destination(&name)?;
            let body = recv_stream.recv_body().await?;
            tracing::debug!("Received {:?} ({})", name, bytesize::ByteSize(body.len() as u64));
            let resolution = resolver.store(&name, &body).await?;
            record(&resolution, body.len() as u64);
            Ok(Outcome::Stored(resolution))
        }
        Header::Delete { path } => {
            recv_stream.expect_eof().await?;
            if !settings.propagate_deletes {
                tracing::info!("Received delete notice for {:?}, destination left unchanged", path);
                common::get_stats().deletes_notified.inc();
                return Ok(Outcome::DeleteNoticed);
            }
            let name = std::path::Path::new(&path)
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("Delete notice {path:?} does not name a file"))?;
            let removed = resolver.remove(name).await?;
            if removed {
                common::get_stats().files_removed.inc();
            } else {
                tracing::info!("Received delete notice for {:?}, no stored file to remove", path);
            }
            Ok(Outcome::Removed(removed))
        }
    }
}

/// Accepts connections on `listener` until `cancel` fires.
///
/// The destination root is created first. Connections over `max_connections` wait for a slot.
/// After cancellation no new connections are accepted, the ones in progress are allowed to finish.
pub async fn serve(
    listener: tokio::net::TcpListener,
    settings: Settings,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    settings
        .limits
        .validate()
        .map_err(|err| anyhow::anyhow!("Invalid limits: {err}"))?;
    tokio::fs::create_dir_all(&settings.root)
        .await
        .with_context(|| format!("Failed to create destination directory {:?}", settings.root))?;
    tracing::info!("Storing received files in {:?}", settings.root);
    let resolver = std::sync::Arc::new(Resolver::new(
        settings.root.clone(),
        settings.limits.max_name_len,
    ));
    let settings = std::sync::Arc::new(settings);
    let permits = std::sync::Arc::new(tokio::sync::Semaphore::new(
        settings.max_connections.max(1),
    ));
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(
                    "Stopping, waiting for {} connection(s), {} in progress",
                    join_set.len(),
                    common::get_stats().connections.pending()
                );
                break;
            }
            Some(res) = join_set.join_next(), if !join_set.is_empty() => {
                if let Err(err) = res {
                    tracing::error!("Connection task failed: {err}");
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::error!("Failed to accept connection: {err}");
                        continue;
                    }
                };
                tracing::debug!("Accepted connection from {peer}");
                let resolver = resolver.clone();
                let settings = settings.clone();
                let permits = permits.clone();
                join_set.spawn(
                    async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        let stats = common::get_stats();
                        let _in_flight = stats.connections.guard();
                        match handle_connection(stream, &resolver, &settings).await {
                            Ok(outcome) => tracing::debug!("Done: {:?}", outcome),
                            Err(err) => {
                                tracing::error!("Connection from {} failed: {:#}", peer, err);
                                stats.failures.inc();
                            }
                        }
                    }
                    .instrument(tracing::info_span!("connection", %peer)),
                );
            }
        }
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            tracing::error!("Connection task failed: {err}");
        }
    }
    Ok(())
}
