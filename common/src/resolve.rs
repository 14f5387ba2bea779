//! Persisting incoming files into the destination root.
//!
//! An incoming `(name, body)` pair either creates a new file, rewrites an identical one, or moves
//! the current occupant aside to the lowest free `_v<N>` sibling before taking its place. All of
//! this runs under a per-path lock so concurrent uploads of the same name are serialized.

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::filename::{self, NameError};
use crate::{hash, versioned};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InvalidName(#[from] NameError),
    #[error("failed to {action} {path:?}")]
    Io {
        action: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    fn io(action: &'static str, path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Error::Io {
            action,
            path,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing was stored under this name before.
    Created,
    /// Stored content had the same digest; it was replaced by the incoming copy.
    Unchanged,
    /// Stored content differed and was moved to `previous`.
    Versioned { previous: std::path::PathBuf },
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Resolution::Created => write!(f, "created"),
            Resolution::Unchanged => write!(f, "identical, overwritten"),
            Resolution::Versioned { previous } => {
                write!(f, "previous version preserved as {previous:?}")
            }
        }
    }
}

type LockMap = std::collections::HashMap<
    std::path::PathBuf,
    std::sync::Arc<tokio::sync::Mutex<()>>,
>;

/// Map from destination path to an exclusive async lock.
///
/// Entries live only while some task holds or waits on them.
#[derive(Debug, Default)]
struct PathLocks {
    inner: std::sync::Mutex<LockMap>,
}

struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: std::path::PathBuf,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl PathLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, LockMap> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn lock(&self, path: &std::path::Path) -> PathGuard<'_> {
        let mutex = self.map().entry(path.to_path_buf()).or_default().clone();
        let guard = mutex.lock_owned().await;
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // release before inspecting the count so the entry can be reclaimed by the last holder
        drop(self.guard.take());
        let mut map = self.locks.map();
        let unused = map
            .get(&self.path)
            .is_some_and(|mutex| std::sync::Arc::strong_count(mutex) == 1);
        if unused {
            map.remove(&self.path);
        }
    }
}

async fn exists(path: &std::path::Path) -> Result<bool, Error> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::io("inspect", path)(err)),
    }
}

fn install(staged: tempfile::TempPath, dst: &std::path::Path) -> Result<(), Error> {
    staged
        .persist(dst)
        .map_err(|err| Error::io("rename into", dst)(err.error))
}

/// Stores incoming files under a single destination root.
#[derive(Debug)]
pub struct Resolver {
    root: std::path::PathBuf,
    max_name_len: usize,
    locks: PathLocks,
}

impl Resolver {
    pub fn new(root: impl Into<std::path::PathBuf>, max_name_len: usize) -> Self {
        Self {
            root: root.into(),
            max_name_len,
            locks: PathLocks::default(),
        }
    }

    /// Validates `name` and returns the path it maps to under the root.
    pub fn destination(&self, name: &str) -> Result<std::path::PathBuf, NameError> {
        filename::destination_path(&self.root, name, self.max_name_len)
    }

    /// Writes `body` under `name`, preserving differing prior content as a versioned sibling.
    ///
    /// The body goes to a temporary file in the root first and is renamed into place, so a failed
    /// write never leaves a partial file or damages what was stored before.
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn store(&self, name: &str, body: &[u8]) -> Result<Resolution, Error> {
        let dst = self.destination(name)?;
        let _guard = self.locks.lock(&dst).await;
        let staged = self.stage(body).await?;
        if !exists(&dst).await? {
            install(staged, &dst)?;
            tracing::info!("Received and saved new file {:?}", dst);
            return Ok(Resolution::Created);
        }
        let existing_digest = hash::digest_file(&dst)
            .await
            .map_err(Error::io("hash", &dst))?;
        let incoming_digest = hash::digest_bytes(body);
        if existing_digest == incoming_digest {
            tracing::info!(
                "File {:?} is identical to the stored one ({}), overwriting",
                dst,
                incoming_digest
            );
            install(staged, &dst)?;
            return Ok(Resolution::Unchanged);
        }
        let previous = self.move_aside(&dst).await?;
        tracing::info!(
            "File {:?} differs from the stored one ({} != {}), renamed existing file to {:?}",
            dst,
            incoming_digest,
            existing_digest,
            previous
        );
        install(staged, &dst)?;
        Ok(Resolution::Versioned { previous })
    }

    /// Writes `body` to a fresh hidden file in the root. The file is deleted when the returned
    /// path is dropped without being installed.
    async fn stage(&self, body: &[u8]) -> Result<tempfile::TempPath, Error> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".filesync-").suffix(".part");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // umask applies, same as for a plain create
            builder.permissions(std::fs::Permissions::from_mode(0o666));
        }
        let (file, path) = builder
            .tempfile_in(&self.root)
            .map_err(Error::io("create a temporary file in", &self.root))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        file.write_all(body)
            .await
            .map_err(Error::io("write", &path))?;
        file.sync_all().await.map_err(Error::io("sync", &path))?;
        Ok(path)
    }

    /// Moves the file at `dst` to its lowest free versioned sibling and returns the sibling.
    ///
    /// The sibling is claimed under its own lock, so an upload that carries the sibling's name
    /// is never overwritten. Siblings have strictly longer names than `dst`, so locks are always
    /// taken from shorter to longer names and cannot deadlock.
    async fn move_aside(&self, dst: &std::path::Path) -> Result<std::path::PathBuf, Error> {
        loop {
            let candidate = versioned::allocate(dst).await;
            let _candidate_guard = self.locks.lock(&candidate).await;
            if exists(&candidate).await? {
                tracing::debug!("{:?} was taken in the meantime, trying the next one", candidate);
                continue;
            }
            tokio::fs::rename(dst, &candidate)
                .await
                .map_err(Error::io("rename", dst))?;
            return Ok(candidate);
        }
    }

    /// Removes the regular file stored under `name`, returns whether anything was removed.
    ///
    /// Versioned siblings are left alone.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<bool, Error> {
        let dst = self.destination(name)?;
        let _guard = self.locks.lock(&dst).await;
        match tokio::fs::symlink_metadata(&dst).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => {
                tracing::warn!("{:?} is not a regular file, not removing", dst);
                return Ok(false);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(Error::io("inspect", &dst)(err)),
        }
        tokio::fs::remove_file(&dst)
            .await
            .map_err(Error::io("remove", &dst))?;
        tracing::info!("Removed {:?}", dst);
        Ok(true)
    }
}
