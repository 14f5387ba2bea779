//! Sending side: every classified change becomes one short-lived connection to the receiver.

use anyhow::Context;
use tracing::instrument;

use crate::watch::{self, SyncEvent, SyncEventKind};

/// Backoff schedule for failed network attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first one, 0 disables retrying
    pub retries: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            initial_backoff: std::time::Duration::from_millis(200),
            max_backoff: std::time::Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Receiver address, `host:port`
    pub server: String,
    pub tcp: remote::TcpConfig,
    /// Read buffer size, also the size of each socket write
    pub chunk_size: usize,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot read {path:?}")]
    Source {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0:?} cannot be sent, its name is not valid UTF-8")]
    UnsupportedName(std::path::PathBuf),
    #[error(transparent)]
    Network(#[from] anyhow::Error),
}

impl TransferError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }

    fn into_report(self) -> anyhow::Error {
        match self {
            TransferError::Network(err) => err,
            other => other.into(),
        }
    }
}

/// Uploads the file at `path` under its file name.
///
/// The file is opened before connecting so that a file which vanished in the meantime never turns
/// into an empty upload. A read failure midway resets the connection, the receiver then discards
/// what it got.
#[instrument(skip(settings))]
pub async fn upload_file(
    path: &std::path::Path,
    settings: &Settings,
) -> Result<u64, TransferError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransferError::UnsupportedName(path.to_path_buf()))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| TransferError::Source {
            path: path.to_path_buf(),
            source,
        })?;
    let mut reader = tokio::io::BufReader::with_capacity(settings.chunk_size, file);
    let mut send_stream = remote::connect_send_stream(&settings.server, &settings.tcp).await?;
    match send_stream.send_upload(name, &mut reader).await {
        Ok(sent) => {
            send_stream.close().await?;
            Ok(sent)
        }
        Err(err) => {
            send_stream.abort();
            Err(err.context(format!("Failed sending {path:?}")).into())
        }
    }
}

/// Tells the receiver that `path` was deleted.
#[instrument(skip(settings))]
pub async fn send_delete_notice(
    path: &std::path::Path,
    settings: &Settings,
) -> Result<(), TransferError> {
    let full_path = path
        .to_str()
        .ok_or_else(|| TransferError::UnsupportedName(path.to_path_buf()))?;
    let mut send_stream = remote::connect_send_stream(&settings.server, &settings.tcp).await?;
    send_stream.send_delete(full_path).await?;
    send_stream.close().await?;
    Ok(())
}

async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransferError>>,
{
    let mut retry = 0;
    loop {
        match attempt().await {
            Err(err) if err.is_retryable() && retry < policy.retries => {
                let delay = policy.backoff(retry);
                retry += 1;
                tracing::warn!(
                    "Attempt failed: {:#}, retrying in {:?} ({}/{})",
                    err.into_report(),
                    delay,
                    retry,
                    policy.retries
                );
                tokio::time::sleep(delay).await;
            }
            res => return res,
        }
    }
}

/// Performs the transfer for one event and records the outcome. Never fails, errors are logged.
#[instrument(skip(settings), fields(kind = %event.kind))]
pub async fn dispatch(event: SyncEvent, settings: &Settings) {
    let stats = common::get_stats();
    let path = event.path.as_path();
    if event.kind == SyncEventKind::Deleted {
        match with_retries(&settings.retry, || send_delete_notice(path, settings)).await {
            Ok(()) => {
                tracing::info!("Sent delete notice for {:?}", path);
                stats.deletes_notified.inc();
            }
            Err(err) => {
                tracing::error!(
                    "Failed to send delete notice for {:?}: {:#}",
                    path,
                    err.into_report()
                );
                stats.failures.inc();
            }
        }
        return;
    }
    if !event.should_forward(watch::is_regular_file) {
        tracing::debug!("{:?} is no longer a regular file, skipping", path);
        return;
    }
    match with_retries(&settings.retry, || upload_file(path, settings)).await {
        Ok(sent) => {
            tracing::info!("Sent {:?} ({})", path, bytesize::ByteSize(sent));
            stats.files_sent.inc();
            stats.bytes_transferred.add(sent);
        }
        Err(err @ TransferError::Source { .. }) => {
            // usually removed right after the notification fired
            tracing::warn!("Skipping upload: {:#}", err.into_report());
        }
        Err(err) => {
            tracing::error!("Failed to upload {:?}: {:#}", path, err.into_report());
            stats.failures.inc();
        }
    }
}

fn describe(event: &SyncEvent) {
    match &event.previous_path {
        Some(previous) => tracing::info!("{}: {:?} -> {:?}", event.kind, previous, event.path),
        None => tracing::info!("{}: {:?}", event.kind, event.path),
    }
}

/// Watches `dir` and sends every change to the configured receiver until `cancel` fires.
///
/// Each event is handled on its own task; at most `max_in_flight` of them transfer at once, the
/// rest wait for a slot without holding up the watcher. On cancellation the transfers already
/// started are allowed to finish.
pub async fn run(
    dir: &std::path::Path,
    settings: Settings,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(dir)
        .await
        .with_context(|| format!("Cannot access {dir:?}"))?;
    if !metadata.is_dir() {
        anyhow::bail!("{dir:?} is not a directory");
    }
    let mut watcher = watch::DirWatcher::new(dir)?;
    tracing::info!("Monitoring folder: {:?}, sending to {}", dir, settings.server);
    let settings = std::sync::Arc::new(settings);
    let permits = std::sync::Arc::new(tokio::sync::Semaphore::new(
        settings.max_in_flight.max(1),
    ));
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(
                    "Stopping, waiting for {} transfer(s), {} in progress",
                    join_set.len(),
                    common::get_stats().connections.pending()
                );
                break;
            }
            Some(res) = join_set.join_next(), if !join_set.is_empty() => {
                if let Err(err) = res {
                    tracing::error!("Transfer task failed: {err}");
                }
            }
            event = watcher.next() => {
                let Some(event) = event else {
                    anyhow::bail!("File system watcher stopped unexpectedly");
                };
                describe(&event);
                let settings = settings.clone();
                let permits = permits.clone();
                join_set.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    let _in_flight = common::get_stats().connections.guard();
                    dispatch(event, &settings).await;
                });
            }
        }
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            tracing::error!("Transfer task failed: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn unreachable_settings() -> Settings {
        // bind and drop to get a port nobody listens on
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .unwrap();
        Settings {
            server: addr.to_string(),
            tcp: remote::TcpConfig::default(),
            chunk_size: 1024,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), std::time::Duration::from_millis(200));
        assert_eq!(policy.backoff(1), std::time::Duration::from_millis(400));
        assert_eq!(policy.backoff(3), std::time::Duration::from_millis(1600));
        assert_eq!(policy.backoff(6), std::time::Duration::from_secs(10));
        assert_eq!(policy.backoff(40), std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    #[traced_test]
    async fn vanished_file_fails_before_connecting() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let settings = unreachable_settings();
        let res = upload_file(&tmp_dir.path().join("gone.txt"), &settings).await;
        let not_found = matches!(
            res,
            Err(TransferError::Source { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound
        );
        assert!(not_found, "{res:?}");
    }

    #[tokio::test]
    #[traced_test]
    async fn refused_connection_is_a_network_error() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("a.txt");
        tokio::fs::write(&path, "content").await.unwrap();
        let res = upload_file(&path, &unreachable_settings()).await;
        assert!(matches!(res, Err(TransferError::Network(_))), "{res:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried() {
        let policy = RetryPolicy {
            retries: 3,
            ..Default::default()
        };
        let counter = std::sync::atomic::AtomicU32::new(0);
        let attempts = &counter;
        let res: Result<(), _> = with_retries(&policy, || async move {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(TransferError::Network(anyhow::anyhow!("connection refused")))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn source_errors_are_not_retried() {
        let policy = RetryPolicy {
            retries: 3,
            ..Default::default()
        };
        let counter = std::sync::atomic::AtomicU32::new(0);
        let attempts = &counter;
        let res: Result<(), _> = with_retries(&policy, || async move {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(TransferError::Source {
                path: "gone.txt".into(),
                source: std::io::ErrorKind::NotFound.into(),
            })
        })
        .await;
        assert!(res.is_err());
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_success() {
        let policy = RetryPolicy {
            retries: 5,
            ..Default::default()
        };
        let counter = std::sync::atomic::AtomicU32::new(0);
        let attempts = &counter;
        let res = with_retries(&policy, || async move {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if n < 2 {
                Err(TransferError::Network(anyhow::anyhow!("reset")))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
    }
}
