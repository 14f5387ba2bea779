//! Change detection on the watched directory.
//!
//! Raw notifications from the platform backend are classified into [`SyncEvent`]s. Nothing is
//! debounced or coalesced: every notification that survives classification turns into one
//! transfer attempt.

use anyhow::Context;
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, Watcher as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl std::fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            SyncEventKind::Created => "Created",
            SyncEventKind::Modified => "Modified",
            SyncEventKind::Deleted => "Deleted",
            SyncEventKind::Renamed => "Renamed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub path: std::path::PathBuf,
    /// Old name, only set for [`SyncEventKind::Renamed`].
    pub previous_path: Option<std::path::PathBuf>,
}

impl SyncEvent {
    fn new(kind: SyncEventKind, path: &std::path::Path) -> Self {
        Self {
            kind,
            path: path.to_path_buf(),
            previous_path: None,
        }
    }

    /// Whether this event should result in a transfer.
    ///
    /// Deletions always go out. Everything else is an upload and is dropped if the path is no
    /// longer a regular file by the time it is dispatched.
    pub fn should_forward(&self, is_file: impl Fn(&std::path::Path) -> bool) -> bool {
        match self.kind {
            SyncEventKind::Deleted => true,
            _ => is_file(&self.path),
        }
    }
}

/// Maps one backend notification to the sync events it implies.
///
/// `is_file` is consulted only for renames where the backend could not tell which side of the
/// rename a path is on.
pub fn classify(
    event: &notify::Event,
    is_file: impl Fn(&std::path::Path) -> bool,
) -> Vec<SyncEvent> {
    let each = |kind| -> Vec<SyncEvent> {
        event
            .paths
            .iter()
            .map(|path| SyncEvent::new(kind, path))
            .collect()
    };
    match event.kind {
        EventKind::Create(CreateKind::Folder) => vec![],
        EventKind::Create(_) => each(SyncEventKind::Created),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime))
        | EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)) => {
            each(SyncEventKind::Modified)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to, ..] => vec![SyncEvent {
                kind: SyncEventKind::Renamed,
                path: to.clone(),
                previous_path: Some(from.clone()),
            }],
            _ => vec![],
        },
        // moved in from outside the watched directory
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(SyncEventKind::Created),
        // moved out, or the first half of a rename that will be reported as `Both`
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![],
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| {
                if is_file(path) {
                    SyncEvent::new(SyncEventKind::Created, path)
                } else {
                    SyncEvent::new(SyncEventKind::Deleted, path)
                }
            })
            .collect(),
        EventKind::Remove(RemoveKind::Folder) => vec![],
        EventKind::Remove(_) => each(SyncEventKind::Deleted),
        EventKind::Modify(_) | EventKind::Access(_) | EventKind::Any | EventKind::Other => vec![],
    }
}

pub fn is_regular_file(path: &std::path::Path) -> bool {
    std::fs::metadata(path).is_ok_and(|md| md.is_file())
}

/// Non-recursive watch on a single directory.
///
/// The backend delivers notifications on its own thread; they are classified there and handed
/// over through an unbounded channel so the callback never blocks.
pub struct DirWatcher {
    _watcher: notify::RecommendedWatcher,
    events: tokio::sync::mpsc::UnboundedReceiver<SyncEvent>,
}

impl DirWatcher {
    pub fn new(dir: &std::path::Path) -> anyhow::Result<Self> {
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    tracing::trace!("Received event: {:?}", event);
                    for sync_event in classify(&event, is_regular_file) {
                        if tx.send(sync_event).is_err() {
                            tracing::debug!("Event receiver gone, dropping notification");
                            return;
                        }
                    }
                }
                Err(err) => tracing::error!("Watcher error: {err}"),
            })
            .context("Failed to create file system watcher")?;
        watcher
            .watch(dir, notify::RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {dir:?}"))?;
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    pub async fn next(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }
}
