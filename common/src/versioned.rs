//! Allocation of `name_v<N>.ext` sibling paths for preserved prior versions.

use tracing::instrument;

/// Builds the `N`-th versioned sibling of `path`.
///
/// The suffix goes before the final extension: `report.txt` -> `report_v1.txt`,
/// `archive.tar.gz` -> `archive.tar_v1.gz`. Names without an extension (including dotfiles like
/// `.bashrc`) get the suffix appended.
pub fn versioned_path(path: &std::path::Path, version: u64) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_v{version}.{}", ext.to_string_lossy()),
        None => format!("{stem}_v{version}"),
    };
    path.with_file_name(name)
}

async fn exists(path: &std::path::Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Returns the lowest-numbered versioned sibling of `path` that does not exist yet, starting at 1.
///
/// The answer is only as good as the moment it was computed; callers serialize access to `path`
/// so that nobody else creates the returned path in between.
#[instrument]
pub async fn allocate(path: &std::path::Path) -> std::path::PathBuf {
    let mut version = 1;
    loop {
        let candidate = versioned_path(path, version);
        if !exists(&candidate).await {
            tracing::debug!("allocated versioned path {:?}", candidate);
            return candidate;
        }
        version += 1;
    }
}
