//! CI gate: hold deploys until the commit's external checks pass.
//!
//! A held request is persisted as `<dir>/.sha-<SHA>` (JSON) so a later
//! invocation carrying only the SHA can resume it. The record exists exactly
//! while the deploy is deferred.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;
use crate::request::DeploymentRequest;
use crate::utils::io;

/// Commit status states as reported by the CI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub context: String,
    pub state: CommitState,
}

impl CommitStatus {
    pub fn new(context: impl Into<String>, state: CommitState) -> Self {
        Self {
            context: context.into(),
            state,
        }
    }
}

/// Where commit statuses are read from and reported to.
pub trait StatusSource {
    /// Every status context currently reported on a commit.
    fn statuses(&self, repository: &str, sha: &str) -> Result<Vec<CommitStatus>>;

    /// Publish this tool's own status on a commit.
    fn report(
        &self,
        repository: &str,
        sha: &str,
        state: CommitState,
        target_url: Option<&str>,
        description: Option<&str>,
    ) -> Result<()>;
}

/// Source used when no CI provider is configured: nothing reported, nothing
/// published.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatusSource;

impl StatusSource for NoStatusSource {
    fn statuses(&self, _repository: &str, _sha: &str) -> Result<Vec<CommitStatus>> {
        Ok(Vec::new())
    }

    fn report(
        &self,
        _repository: &str,
        _sha: &str,
        _state: CommitState,
        _target_url: Option<&str>,
        _description: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// A deferred deploy, persisted per commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCiRecord {
    pub request: DeploymentRequest,
    /// Tree the deploy targets; the record is stale once it is gone.
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CiGate {
    required: Vec<String>,
    self_context: String,
}

impl CiGate {
    /// `required` empty means every reported context except `self_context`
    /// must be green.
    pub fn new(required: Vec<String>, self_context: impl Into<String>) -> Self {
        Self {
            required,
            self_context: self_context.into(),
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn self_context(&self) -> &str {
        &self.self_context
    }

    /// Whether the deploy described by `request` may run now.
    ///
    /// A status source failure holds the deploy.
    pub fn should_proceed(&self, request: &DeploymentRequest, source: &dyn StatusSource) -> bool {
        if request.force {
            return true;
        }
        let Some((repository, sha)) = request.ci_key() else {
            return true;
        };

        match source.statuses(repository, sha) {
            Ok(statuses) => self.evaluate(&statuses),
            Err(e) => {
                log_status!("ci", "Cannot read statuses of {}@{}: {}", repository, sha, e.describe());
                false
            }
        }
    }

    /// Apply the gate rules to a status list.
    pub fn evaluate(&self, statuses: &[CommitStatus]) -> bool {
        if self.required.is_empty() {
            return statuses
                .iter()
                .filter(|s| s.context != self.self_context)
                .all(|s| s.state == CommitState::Success);
        }

        self.required.iter().all(|context| {
            statuses
                .iter()
                .any(|s| &s.context == context && s.state == CommitState::Success)
        })
    }

    /// Persist `request` under its SHA in `records_dir` and publish a pending
    /// status. `tree` is the tree the deploy will target; it is created so the
    /// record is not mistaken for stale.
    ///
    /// Returns the record path. Older records for the same pull-request branch
    /// are removed.
    pub fn on_hold(
        &self,
        request: &DeploymentRequest,
        records_dir: &Path,
        tree: &Path,
        source: &dyn StatusSource,
    ) -> Result<PathBuf> {
        let Some((repository, sha)) = request.ci_key() else {
            return Err(Error::validation_missing_argument(vec![
                "pull-repository".to_string(),
                "pull-sha".to_string(),
            ]));
        };

        io::ensure_dir(tree, "create held tree")?;
        let record = PendingCiRecord {
            request: request.clone(),
            dir: tree.to_path_buf(),
        };
        let path = write_record(records_dir, sha, &record)?;
        supersede(records_dir, request);

        if let Err(e) = source.report(
            repository,
            sha,
            CommitState::Pending,
            None,
            Some("Waiting for required checks."),
        ) {
            log_status!("ci", "Cannot publish pending status: {}", e.describe());
        }

        Ok(path)
    }
}

fn write_record(dir: &Path, sha: &str, record: &PendingCiRecord) -> Result<PathBuf> {
    let content = serde_json::to_string_pretty(record)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize CI record".to_string())))?;
    let path = paths::sha_record(dir, sha);
    io::write_file_atomic(&path, &content, "write CI record")?;
    Ok(path)
}

fn read_record(path: &Path) -> Result<PendingCiRecord> {
    let content = io::read_file(path, "read CI record")?;
    serde_json::from_str(&content).map_err(|e| {
        Error::internal_json(e.to_string(), Some(format!("parse {}", path.display())))
    })
}

/// Load the deferred request recorded for `sha`.
pub fn resolve(records_dir: &Path, sha: &str) -> Result<PendingCiRecord> {
    let path = paths::sha_record(records_dir, sha);
    if !path.is_file() {
        return Err(Error::ci_record_not_found(
            sha,
            records_dir.display().to_string(),
        ));
    }
    read_record(&path)
}

/// Delete the record for `sha`, if any.
pub fn remove(records_dir: &Path, sha: &str) -> Result<()> {
    io::remove_any(&paths::sha_record(records_dir, sha), "remove CI record")
}

/// Every record file in `records_dir`, with its SHA.
pub fn list_records(records_dir: &Path) -> Vec<(String, PathBuf)> {
    let pattern = records_dir
        .join(format!("{}*", paths::SHA_RECORD_PREFIX))
        .to_string_lossy()
        .to_string();

    let Ok(entries) = glob::glob(&pattern) else {
        return Vec::new();
    };

    let mut records: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let sha = name.strip_prefix(paths::SHA_RECORD_PREFIX)?.to_string();
            Some((sha, path))
        })
        .collect();
    records.sort();
    records
}

/// Remove records for the same pull-request branch as `request` but a
/// different commit. Returns the removed SHAs.
pub fn supersede(records_dir: &Path, request: &DeploymentRequest) -> Vec<String> {
    let Some(pull_branch) = request.pull_branch.as_deref() else {
        return Vec::new();
    };
    let current_sha = request.commit_sha.as_deref();

    let mut removed = Vec::new();
    for (sha, path) in list_records(records_dir) {
        if Some(sha.as_str()) == current_sha {
            continue;
        }
        let Ok(record) = read_record(&path) else {
            continue;
        };
        if record.request.pull_branch.as_deref() != Some(pull_branch) {
            continue;
        }
        match io::remove_any(&path, "remove superseded CI record") {
            Ok(()) => removed.push(sha),
            Err(e) => log_status!("ci", "Cannot remove {}: {}", path.display(), e.describe()),
        }
    }
    removed
}

/// Delete records whose target directory no longer exists. Unreadable records
/// are left alone. Returns the removed SHAs.
pub fn sweep(records_dir: &Path) -> Vec<String> {
    let mut removed = Vec::new();
    for (sha, path) in list_records(records_dir) {
        let record = match read_record(&path) {
            Ok(record) => record,
            Err(e) => {
                log_status!("ci", "Skipping unreadable record {}: {}", path.display(), e.describe());
                continue;
            }
        };
        if record.dir.is_dir() {
            continue;
        }
        match io::remove_any(&path, "sweep CI record") {
            Ok(()) => removed.push(sha),
            Err(e) => log_status!("ci", "Cannot remove {}: {}", path.display(), e.describe()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    struct FakeSource {
        statuses: Result<Vec<CommitStatus>>,
        reported: RefCell<Vec<(String, CommitState)>>,
    }

    impl FakeSource {
        fn with(statuses: Vec<CommitStatus>) -> Self {
            Self {
                statuses: Ok(statuses),
                reported: RefCell::new(Vec::new()),
            }
        }
    }

    impl StatusSource for FakeSource {
        fn statuses(&self, _repository: &str, _sha: &str) -> Result<Vec<CommitStatus>> {
            self.statuses.clone()
        }

        fn report(
            &self,
            _repository: &str,
            sha: &str,
            state: CommitState,
            _target_url: Option<&str>,
            _description: Option<&str>,
        ) -> Result<()> {
            self.reported.borrow_mut().push((sha.to_string(), state));
            Ok(())
        }
    }

    fn pr_request(dir: &Path, branch: &str, sha: &str) -> DeploymentRequest {
        DeploymentRequest {
            clone_url: Some("git@example.com:org/repo.git".to_string()),
            pull_branch: Some(branch.to_string()),
            pull_repository: Some("org/repo".to_string()),
            commit_sha: Some(sha.to_string()),
            ..DeploymentRequest::new(dir)
        }
    }

    fn gate(required: &[&str]) -> CiGate {
        CiGate::new(required.iter().map(|s| s.to_string()).collect(), "hooks")
    }

    #[test]
    fn proceeds_without_repository_or_sha() {
        let source = FakeSource::with(vec![CommitStatus::new("ci", CommitState::Failure)]);
        let mut request = DeploymentRequest::new("/srv");
        assert!(gate(&["ci"]).should_proceed(&request, &source));

        request.commit_sha = Some("abc".to_string());
        assert!(gate(&["ci"]).should_proceed(&request, &source));
    }

    #[test]
    fn force_bypasses_checks() {
        let source = FakeSource::with(vec![CommitStatus::new("ci", CommitState::Pending)]);
        let mut request = pr_request(Path::new("/srv"), "feature/x", "abc");
        assert!(!gate(&["ci"]).should_proceed(&request, &source));

        request.force = true;
        assert!(gate(&["ci"]).should_proceed(&request, &source));
    }

    #[test]
    fn empty_required_list_ignores_own_context() {
        let gate = gate(&[]);
        assert!(gate.evaluate(&[
            CommitStatus::new("ci", CommitState::Success),
            CommitStatus::new("hooks", CommitState::Pending),
        ]));
        assert!(!gate.evaluate(&[
            CommitStatus::new("ci", CommitState::Success),
            CommitStatus::new("lint", CommitState::Failure),
        ]));
        assert!(gate.evaluate(&[]));
    }

    #[test]
    fn required_contexts_must_all_be_green() {
        let gate = gate(&["ci", "lint"]);
        assert!(gate.evaluate(&[
            CommitStatus::new("ci", CommitState::Success),
            CommitStatus::new("lint", CommitState::Success),
            CommitStatus::new("coverage", CommitState::Failure),
        ]));
        assert!(!gate.evaluate(&[CommitStatus::new("ci", CommitState::Success)]));
        assert!(!gate.evaluate(&[
            CommitStatus::new("ci", CommitState::Success),
            CommitStatus::new("lint", CommitState::Error),
        ]));
    }

    #[test]
    fn source_failure_holds() {
        let source = FakeSource {
            statuses: Err(Error::external_service("GitHub", "timeout", None)),
            reported: RefCell::new(Vec::new()),
        };
        let request = pr_request(Path::new("/srv"), "feature/x", "abc");
        assert!(!gate(&[]).should_proceed(&request, &source));
    }

    #[test]
    fn hold_then_resolve_round_trips_request() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("pulls/feature-x");
        let request = pr_request(dir.path(), "feature/x", "abc123");
        let source = FakeSource::with(Vec::new());

        let path = gate(&["ci"])
            .on_hold(&request, dir.path(), &tree, &source)
            .unwrap();

        assert_eq!(path, dir.path().join(".sha-abc123"));
        assert!(tree.is_dir());
        let record = resolve(dir.path(), "abc123").unwrap();
        assert_eq!(record.request, request);
        assert_eq!(record.dir, tree);
        assert_eq!(
            source.reported.borrow().as_slice(),
            &[("abc123".to_string(), CommitState::Pending)]
        );
    }

    #[test]
    fn resolve_unknown_sha_is_not_found() {
        let dir = tempdir().unwrap();
        let err = resolve(dir.path(), "deadbeef").unwrap_err();
        assert_eq!(err.code.as_str(), "ci.record_not_found");
    }

    #[test]
    fn holding_newer_commit_supersedes_older_record() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("pulls/feature-x");
        let source = FakeSource::with(Vec::new());
        let gate = gate(&[]);

        gate.on_hold(&pr_request(dir.path(), "feature/x", "old"), dir.path(), &tree, &source)
            .unwrap();
        gate.on_hold(&pr_request(dir.path(), "feature/y", "other"), dir.path(), &tree, &source)
            .unwrap();
        gate.on_hold(&pr_request(dir.path(), "feature/x", "new"), dir.path(), &tree, &source)
            .unwrap();

        let shas: Vec<String> = list_records(dir.path()).into_iter().map(|(s, _)| s).collect();
        assert_eq!(shas, vec!["new", "other"]);
    }

    #[test]
    fn sweep_removes_only_records_with_missing_dirs() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("pulls/live");
        let gone = dir.path().join("pulls/gone");
        let source = FakeSource::with(Vec::new());
        let gate = gate(&[]);

        gate.on_hold(&pr_request(dir.path(), "live", "aaa"), dir.path(), &live, &source)
            .unwrap();
        gate.on_hold(&pr_request(dir.path(), "gone", "bbb"), dir.path(), &gone, &source)
            .unwrap();
        fs::write(dir.path().join(".sha-broken"), "not json").unwrap();
        fs::remove_dir_all(&gone).unwrap();

        let removed = sweep(dir.path());

        assert_eq!(removed, vec!["bbb"]);
        assert!(dir.path().join(".sha-aaa").is_file());
        assert!(dir.path().join(".sha-broken").is_file());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        remove(dir.path(), "nothing").unwrap();
    }
}
