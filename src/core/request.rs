//! Deployment requests and the release variant they resolve to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::slugify;

/// Everything needed to run (or resume) one install.
///
/// Built once from CLI flags or job args and passed by reference afterwards.
/// Serialized as JSON inside CI-gate records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub update: bool,
}

/// Which release tree a request deploys into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployTarget {
    /// The main tree, `<working_dir>/<release.directory>`.
    StandardRelease { root: PathBuf },
    /// A staging tree, `<working_dir>/pulls/<sanitized-branch>`.
    PullRequestRelease {
        root: PathBuf,
        pull_branch: String,
        dir_name: String,
    },
}

impl DeployTarget {
    pub fn root(&self) -> &Path {
        match self {
            DeployTarget::StandardRelease { root } => root,
            DeployTarget::PullRequestRelease { root, .. } => root,
        }
    }

    pub fn is_pull_request(&self) -> bool {
        matches!(self, DeployTarget::PullRequestRelease { .. })
    }
}

impl DeploymentRequest {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    /// Repository and commit to gate on, when both are known.
    pub fn ci_key(&self) -> Option<(&str, &str)> {
        match (self.pull_repository.as_deref(), self.commit_sha.as_deref()) {
            (Some(repo), Some(sha)) if !repo.is_empty() && !sha.is_empty() => Some((repo, sha)),
            _ => None,
        }
    }

    /// A request carrying only a commit SHA continues a deferred deploy.
    pub fn is_continuation(&self) -> bool {
        self.commit_sha.is_some()
            && self.clone_url.is_none()
            && self.pull_branch.is_none()
            && self.branch.is_none()
    }

    /// Reject values that would escape the working directory once used as
    /// path components: dot-named staging dirs and non-hex record names.
    pub fn validate(&self) -> Result<()> {
        if let Some(pull_branch) = &self.pull_branch {
            staging_dir_name(pull_branch)?;
        }
        if let Some(sha) = &self.commit_sha {
            validate_sha(sha)?;
        }
        Ok(())
    }

    /// Staging directory name for the pull-request branch.
    pub fn pull_dir_name(&self) -> Option<String> {
        self.pull_branch.as_deref().map(slugify::branch_dir)
    }

    /// Release tree this request deploys into.
    pub fn target(&self, release_directory: Option<&str>) -> DeployTarget {
        match (&self.pull_branch, self.pull_dir_name()) {
            (Some(pull_branch), Some(dir_name)) => DeployTarget::PullRequestRelease {
                root: paths::pulls(&self.working_dir).join(&dir_name),
                pull_branch: pull_branch.clone(),
                dir_name,
            },
            _ => {
                let root = match release_directory {
                    Some(dir) => self.working_dir.join(dir.trim_start_matches('/')),
                    None => self.working_dir.clone(),
                };
                DeployTarget::StandardRelease { root }
            }
        }
    }

    /// Directory whose `.lock` serializes deploys of this request.
    ///
    /// Known before the repository config is read: the staging tree for pull
    /// requests, the working directory otherwise.
    pub fn lock_root(&self) -> PathBuf {
        match self.pull_dir_name() {
            Some(dir_name) => paths::pulls(&self.working_dir).join(dir_name),
            None => self.working_dir.clone(),
        }
    }

    /// Carry flags from a resuming invocation onto a persisted request.
    pub fn resumed_with(mut self, invocation: &DeploymentRequest) -> Self {
        self.force = self.force || invocation.force;
        self.silent = self.silent || invocation.silent;
        self
    }

    /// Decode queue job args. Keys may be given with or without a leading `--`.
    pub fn from_job_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let mut request = DeploymentRequest::new(".");

        for (raw_key, value) in args {
            let key = raw_key.trim_start_matches("--");
            match key {
                "dir" | "d" => request.working_dir = paths::expand_dir(value),
                "url" | "u" => request.clone_url = non_empty(value),
                "branch" => request.branch = non_empty(value),
                "pull-branch" => request.pull_branch = non_empty(value),
                "pull-sha" => request.commit_sha = non_empty(value),
                "pull-repository" => request.pull_repository = non_empty(value),
                "pull-id" => request.pull_id = non_empty(value),
                "pull-force" => request.force = parse_flag(key, value)?,
                "silent" => request.silent = parse_flag(key, value)?,
                "update" => request.update = parse_flag(key, value)?,
                _ => {
                    log_status!("job", "Ignoring unknown argument '{}'", raw_key);
                }
            }
        }

        Ok(request)
    }
}

/// Staging directory name for `pull_branch`, refusing names that resolve to
/// the pulls directory itself, its parent, or a hidden entry.
pub fn staging_dir_name(pull_branch: &str) -> Result<String> {
    let dir_name = slugify::branch_dir(pull_branch);
    if dir_name.is_empty() || dir_name.starts_with('.') {
        return Err(Error::validation_invalid_argument(
            "pull-branch",
            format!("'{}' does not name a staging directory", pull_branch),
            Some(pull_branch.to_string()),
            None,
        ));
    }
    Ok(dir_name)
}

/// Commit SHAs name record files, so only hex digits are accepted.
pub fn validate_sha(sha: &str) -> Result<()> {
    if sha.len() < 4 || sha.len() > 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation_invalid_argument(
            "pull-sha",
            format!("'{}' is not a commit SHA", sha),
            Some(sha.to_string()),
            None,
        ));
    }
    Ok(())
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::validation_invalid_argument(
            key,
            format!("'{}' is not a boolean", other),
            None,
            Some(vec!["true".to_string(), "false".to_string()]),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_clap_style_job_args() {
        let request = DeploymentRequest::from_job_args(&args(&[
            ("--dir", "/srv/app"),
            ("--url", "git@github.com:org/repo.git"),
            ("--pull-branch", "feature/login"),
            ("--pull-sha", "abc123"),
            ("--pull-repository", "org/repo"),
            ("--silent", "true"),
            ("branch", "master"),
        ]))
        .unwrap();

        assert_eq!(request.working_dir, PathBuf::from("/srv/app"));
        assert_eq!(request.branch.as_deref(), Some("master"));
        assert_eq!(request.pull_branch.as_deref(), Some("feature/login"));
        assert_eq!(request.ci_key(), Some(("org/repo", "abc123")));
        assert!(request.silent);
        assert!(!request.force);
    }

    #[test]
    fn rejects_non_boolean_flags() {
        let err = DeploymentRequest::from_job_args(&args(&[("--silent", "maybe")])).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
    }

    #[test]
    fn pull_request_target_uses_sanitized_staging_dir() {
        let mut request = DeploymentRequest::new("/srv/app");
        request.pull_branch = Some("feature/login".to_string());

        let target = request.target(Some("www"));
        assert!(target.is_pull_request());
        assert_eq!(target.root(), Path::new("/srv/app/pulls/feature-login"));
        assert_eq!(request.lock_root(), PathBuf::from("/srv/app/pulls/feature-login"));
    }

    #[test]
    fn standard_target_uses_release_directory() {
        let request = DeploymentRequest::new("/srv/app");
        assert_eq!(
            request.target(Some("www")),
            DeployTarget::StandardRelease {
                root: PathBuf::from("/srv/app/www")
            }
        );
        assert_eq!(request.target(None).root(), Path::new("/srv/app"));
        assert_eq!(request.lock_root(), PathBuf::from("/srv/app"));
    }

    #[test]
    fn sha_only_request_is_a_continuation() {
        let mut request = DeploymentRequest::new("/srv/app");
        request.commit_sha = Some("abc123".to_string());
        assert!(request.is_continuation());

        request.clone_url = Some("git@example.com:repo.git".to_string());
        assert!(!request.is_continuation());
    }

    #[test]
    fn dot_named_pull_branches_are_rejected() {
        for branch in ["..", ".", " ", ".hidden", "../.."] {
            let mut request = DeploymentRequest::new("/srv/app");
            request.pull_branch = Some(branch.to_string());
            let err = request.validate().unwrap_err();
            assert_eq!(err.code.as_str(), "validation.invalid_argument", "{}", branch);
        }

        let mut request = DeploymentRequest::new("/srv/app");
        request.pull_branch = Some("feature/..".to_string());
        assert!(request.validate().is_ok());
        assert_eq!(request.pull_dir_name().as_deref(), Some("feature-.."));
    }

    #[test]
    fn commit_sha_must_be_hex() {
        let mut request = DeploymentRequest::new("/srv/app");
        request.commit_sha = Some("abc123".to_string());
        assert!(request.validate().is_ok());

        for sha in ["../../etc/passwd", "abc/def", "xyz123", "ab"] {
            request.commit_sha = Some(sha.to_string());
            assert!(request.validate().is_err(), "{}", sha);
        }
    }

    #[test]
    fn ci_key_requires_repository_and_sha() {
        let mut request = DeploymentRequest::new("/srv/app");
        request.commit_sha = Some("abc123".to_string());
        assert_eq!(request.ci_key(), None);
        request.pull_repository = Some("org/repo".to_string());
        assert_eq!(request.ci_key(), Some(("org/repo", "abc123")));
    }

    #[test]
    fn resuming_keeps_force_from_invocation() {
        let stored = DeploymentRequest::new("/srv/app");
        let mut invocation = DeploymentRequest::new("/srv/app");
        invocation.force = true;

        assert!(stored.resumed_with(&invocation).force);
    }
}
