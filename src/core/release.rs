//! Release tree layout and lifecycle.
//!
//! ```text
//! <root>/
//!   shared/            files persisted across releases
//!   releases/<id>/     one directory per release, id = %Y%m%d%H%M%S
//!   current -> releases/<id>
//! ```
//!
//! `current` is only ever replaced by renaming a freshly created symlink over
//! it, so a reader resolves either the previous or the new release.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::utils::io;

pub const SHARED_DIR: &str = "shared";
pub const RELEASES_DIR: &str = "releases";
pub const CURRENT_LINK: &str = "current";

/// Sortable release id for the current local time.
pub fn new_release_id() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Lifecycle state of a release directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    /// Created but not (yet) pointed to by `current`.
    Building,
    /// Target of `current`.
    Promoted,
    /// Kept by pruning.
    Retained,
    /// Deleted by pruning.
    Pruned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTree {
    root: PathBuf,
}

impl ReleaseTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(SHARED_DIR)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    pub fn release_dir(&self, id: &str) -> PathBuf {
        self.releases_dir().join(id)
    }

    /// Release ids, newest first.
    pub fn list_releases(&self) -> Result<Vec<String>> {
        let dir = self.releases_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::internal_io(
                    e.to_string(),
                    Some("list releases".to_string()),
                ))
            }
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Id of the release `current` points at, if any.
    pub fn current_release(&self) -> Option<String> {
        let target = fs::read_link(self.current_link()).ok()?;
        let target = if target.is_absolute() {
            target
        } else {
            self.root.join(target)
        };

        if target.parent()? != self.releases_dir() {
            return None;
        }
        target.file_name()?.to_str().map(str::to_string)
    }

    pub fn state_of(&self, id: &str) -> ReleaseState {
        if !self.release_dir(id).is_dir() {
            ReleaseState::Pruned
        } else if self.current_release().as_deref() == Some(id) {
            ReleaseState::Promoted
        } else {
            ReleaseState::Building
        }
    }
}

/// Outcome of one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub retained: Vec<String>,
    pub pruned: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

/// Ensure `shared/` and `releases/` exist, then move `source` into
/// `releases/<id>`. Returns the release directory.
pub fn create_release(tree: &ReleaseTree, id: &str, source: &Path) -> Result<PathBuf> {
    io::ensure_dir(&tree.shared_dir(), "create shared directory")?;
    io::ensure_dir(&tree.releases_dir(), "create releases directory")?;

    let destination = tree.release_dir(id);
    if destination.is_dir() && !source.exists() {
        return Ok(destination);
    }

    fs::rename(source, &destination).map_err(|e| {
        Error::internal_io(
            format!(
                "Cannot move {} to {}: {}",
                source.display(),
                destination.display(),
                e
            ),
            Some("create release".to_string()),
        )
    })?;

    Ok(destination)
}

/// Replace `releases/<id>/<relative>` with a symlink to `shared/<relative>`.
pub fn link_shared(tree: &ReleaseTree, id: &str, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim_start_matches('/');
    let link = tree.release_dir(id).join(relative);
    let target = tree.shared_dir().join(relative);

    io::remove_any(&link, "remove release path before linking")?;
    if let Some(parent) = link.parent() {
        io::ensure_dir(parent, "create link parent")?;
    }

    symlink(&target, &link).map_err(|e| {
        Error::internal_io(
            format!("Cannot link {} to {}: {}", link.display(), target.display(), e),
            Some("link shared".to_string()),
        )
    })?;

    Ok(link)
}

/// Atomically point `current` at `releases/<id>`.
pub fn promote(tree: &ReleaseTree, id: &str) -> Result<()> {
    let release = tree.release_dir(id);
    let tree_display = tree.root().display().to_string();

    if !release.is_dir() {
        return Err(Error::release_promote_failed(
            id,
            &tree_display,
            format!("{} does not exist", release.display()),
        ));
    }

    let staging = tree
        .root()
        .join(format!(".{}.{}", CURRENT_LINK, uuid::Uuid::new_v4().simple()));

    symlink(&release, &staging)
        .map_err(|e| Error::release_promote_failed(id, &tree_display, e.to_string()))?;

    if let Err(e) = fs::rename(&staging, tree.current_link()) {
        let _ = fs::remove_file(&staging);
        return Err(Error::release_promote_failed(id, &tree_display, e.to_string()));
    }

    Ok(())
}

/// Delete old releases, keeping at most `keep` of them.
///
/// The promoted release always survives and counts toward `keep`; the
/// remaining slots go to the newest other releases. `None` keeps everything.
/// Deletion failures are logged and do not stop the pass.
pub fn prune(tree: &ReleaseTree, keep: Option<usize>) -> Result<PruneReport> {
    let ids = tree.list_releases()?;

    let Some(keep) = keep.filter(|k| *k > 0) else {
        return Ok(PruneReport {
            retained: ids,
            ..PruneReport::default()
        });
    };

    let current = tree.current_release();
    let mut slots = keep;
    if current.as_ref().is_some_and(|c| ids.contains(c)) {
        slots -= 1;
    }

    let mut report = PruneReport::default();
    for id in ids {
        if current.as_deref() == Some(id.as_str()) {
            report.retained.push(id);
            continue;
        }

        if slots > 0 {
            slots -= 1;
            report.retained.push(id);
            continue;
        }

        match io::remove_any(&tree.release_dir(&id), "prune release") {
            Ok(()) => report.pruned.push(id),
            Err(e) => {
                log_status!("release", "Failed to remove release {}: {}", id, e.describe());
                report.failed.push(id);
            }
        }
    }

    Ok(report)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}
