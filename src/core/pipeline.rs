//! The deploy pipeline: `install`, `clean` and `trigger`.
//!
//! Install order:
//!
//! 1. resume a held request when only a SHA was given
//! 2. CI gate (hold and return, or continue)
//! 3. lock the target tree
//! 4. clone and checkout (or update in place)
//! 5. load `hooks.yml`, set the built-in environment
//! 6. move the checkout into `releases/<id>`
//! 7. branch env and commands, pull-request env, commands and `pulls.open`
//! 8. shared links and `release.after`
//! 9. promote, then prune (or `release.standalone` for in-place installs)
//! 10. local `after` commands, unlock, final status, notifications
//!
//! Steps 1-6 fail fast with configuration or setup errors. From step 7 on,
//! command failures are recorded and the pipeline keeps going; only a failed
//! promotion aborts.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ci_gate::{self, CiGate, CommitState, NoStatusSource, StatusSource};
use crate::config::{self, LocalConfig, PullsConfig, ReleaseConfig, RepoConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::git;
use crate::github::GithubStatusClient;
use crate::lock::{LockCoordinator, LockEvent};
use crate::notify::{self, Notification, Notifier, SendmailNotifier, SlackNotifier};
use crate::paths;
use crate::release::{self, PruneReport, ReleaseTree};
use crate::request::{non_empty, parse_flag, staging_dir_name, DeployTarget, DeploymentRequest};
use crate::runner::{CommandRecord, CommandRunner, ExecutionContext};
use crate::utils::{io, slugify, template};

const SUCCESS_DESCRIPTION: &str = "Staging environment has been updated.";
const FAILURE_DESCRIPTION: &str = "Deploy finished with failing commands.";

/// Collaborators shared by every pipeline run.
pub struct Services {
    pub local: LocalConfig,
    pub status_source: Box<dyn StatusSource>,
    pub notifiers: Vec<Box<dyn Notifier>>,
    pub locks: LockCoordinator,
    /// Echo transcripts on stderr.
    pub echo: bool,
}

impl Services {
    /// Production wiring: GitHub statuses when a token is configured,
    /// sendmail and Slack notifications.
    pub fn from_local_config(local: LocalConfig) -> Result<Self> {
        let status_source: Box<dyn StatusSource> = match local.github.token.as_deref() {
            Some(token) if !token.is_empty() => Box::new(GithubStatusClient::new(&local.github)?),
            _ => Box::new(NoStatusSource),
        };

        let notifiers: Vec<Box<dyn Notifier>> = vec![
            Box::new(SendmailNotifier::new(&local.email)),
            Box::new(SlackNotifier::new(&local.messages)?),
        ];

        Ok(Self {
            local,
            status_source,
            notifiers,
            locks: LockCoordinator::new(),
            echo: true,
        })
    }

    /// No external effects; for tests and dry wiring.
    pub fn offline(local: LocalConfig) -> Self {
        Self {
            local,
            status_source: Box::new(NoStatusSource),
            notifiers: Vec::new(),
            locks: LockCoordinator::new(),
            echo: false,
        }
    }

    fn runner(&self, cwd: &Path, log: Option<PathBuf>) -> CommandRunner {
        let mut runner = CommandRunner::new(ExecutionContext::new(cwd));
        if !self.echo {
            runner = runner.quiet();
        }
        match log {
            Some(path) => runner.with_transcript_file(path),
            None => runner,
        }
    }

    fn report_status(
        &self,
        request: &DeploymentRequest,
        state: CommitState,
        target_url: Option<&str>,
        description: Option<&str>,
    ) {
        let Some((repository, sha)) = request.ci_key() else {
            return;
        };
        if let Err(e) = self
            .status_source
            .report(repository, sha, state, target_url, description)
        {
            log_status!("ci", "Cannot publish {} status: {}", state.as_str(), e.describe());
        }
    }
}

// ============================================================================
// Install
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<PruneReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_url: Option<String>,
    pub has_failure: bool,
    pub commands: Vec<CommandRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notified: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    Deployed(DeployReport),
    #[serde(rename_all = "camelCase")]
    Held { sha: String, record: PathBuf },
}

pub fn install(invocation: &DeploymentRequest, services: &Services) -> Result<InstallOutcome> {
    invocation.validate()?;
    let resumed = resume_held(invocation)?;
    let request = resumed.as_ref().unwrap_or(invocation);
    request.validate()?;

    if request.ci_key().is_some() {
        let gate = CiGate::new(
            required_contexts(request),
            services.local.github.context.clone(),
        );
        if !gate.should_proceed(request, services.status_source.as_ref()) {
            let sha = request.commit_sha.clone().unwrap_or_default();
            let record = gate.on_hold(
                request,
                &request.working_dir,
                &request.lock_root(),
                services.status_source.as_ref(),
            )?;
            log_status!("install", "Checks pending for {}, deploy held", sha);
            return Ok(InstallOutcome::Held { sha, record });
        }

        if let Some(sha) = request.commit_sha.as_deref() {
            ci_gate::remove(&request.working_dir, sha)?;
        }
        ci_gate::supersede(&request.working_dir, request);
        services.report_status(request, CommitState::Pending, None, None);
    }

    let lock = services
        .locks
        .acquire(&request.lock_root(), |event| match event {
            LockEvent::Waiting { path, age } => log_status!(
                "lock",
                "Waiting for {} (held {}s)",
                path.display(),
                age.as_secs()
            ),
            LockEvent::Reclaimed { path, age } => log_status!(
                "lock",
                "Reclaimed stale {} ({}s old)",
                path.display(),
                age.as_secs()
            ),
        })?;

    let report = deploy(request, services)?;
    lock.release();

    let report = finish(request, services, report);
    Ok(InstallOutcome::Deployed(report))
}

/// The held request a SHA-only invocation continues.
///
/// With no record for the SHA, an invocation that also names a repository is
/// gated as a fresh request; a bare SHA is NotFound.
fn resume_held(invocation: &DeploymentRequest) -> Result<Option<DeploymentRequest>> {
    if !invocation.is_continuation() {
        return Ok(None);
    }
    let sha = invocation.commit_sha.as_deref().unwrap_or_default();
    match ci_gate::resolve(&invocation.working_dir, sha) {
        Ok(record) => {
            log_status!("install", "Resuming held deploy of {}", sha);
            Ok(Some(record.request.resumed_with(invocation)))
        }
        Err(e) if e.code == ErrorCode::CiRecordNotFound && invocation.ci_key().is_some() => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// State carried from the locked section to the notification step.
struct Deployed {
    report: DeployReport,
    transcript: String,
    checkout: PathBuf,
    repo: RepoConfig,
    release: Option<ReleaseConfig>,
}

fn deploy(request: &DeploymentRequest, services: &Services) -> Result<Deployed> {
    let base = request.working_dir.as_path();
    let branch = request
        .branch
        .clone()
        .unwrap_or_else(|| git::head_branch(base));

    let log_file = if request.silent {
        None
    } else {
        transcript_log(base, "install")
    };
    let mut runner = services.runner(base, log_file.clone());

    let release_id = request.clone_url.as_ref().map(|_| release::new_release_id());
    let checkout = match (&request.clone_url, &release_id) {
        (Some(url), Some(id)) => {
            let checkout = base.join(format!(".checkout-{}", uuid::Uuid::new_v4().simple()));
            let destination = checkout.to_string_lossy().to_string();
            if runner.run(&git::clone_command(url, &destination), true, true) != 0 {
                return Err(Error::internal_io(
                    format!("git clone of {} failed", url),
                    Some("clone repository".to_string()),
                ));
            }
            runner.change_directory(&checkout)?;
            let reference = request.pull_branch.as_deref().unwrap_or(&branch);
            runner.run(&git::checkout_command(reference), true, true);
            checkout
        }
        _ => {
            if request.update {
                runner.run(&git::pull_command(&branch), true, true);
            }
            base.to_path_buf()
        }
    };

    let repo = match config::load_repo_config(&checkout) {
        Ok(repo) => repo,
        Err(e) => {
            discard_checkout(request, &checkout);
            return Err(e);
        }
    };
    let section = repo.branch(&branch).cloned().unwrap_or_default();
    let pulls: Option<&PullsConfig> = request.pull_branch.as_ref().and(repo.pulls());
    let release = pulls
        .and_then(|p| p.release.clone())
        .or_else(|| section.release.clone());

    if request.clone_url.is_some() && release.is_none() {
        discard_checkout(request, &checkout);
        return Err(Error::config_invalid_value(
            format!("{}.release", branch),
            None,
            "You cannot set a Git clone URL without any release info.",
        ));
    }

    builtin_env(&mut runner, request, &branch);

    let target = request.target(release.as_ref().and_then(|r| r.directory.as_deref()));
    let tree = ReleaseTree::new(target.root());
    if let (Some(id), Some(_)) = (&release_id, &release) {
        let release_dir = release::create_release(&tree, id, &checkout)?;
        runner.change_directory(&release_dir)?;
        runner.set_env("RELEASE_ID", id);
        runner.set_env("RELEASE_DIR", &release_dir.to_string_lossy());
    }

    runner.put_env_all(&section.env);
    if let Some(pulls) = pulls {
        runner.put_env_all(&pulls.env);
    }
    runner.run_all(&section.commands);
    if let Some(pulls) = pulls {
        runner.run_all(&pulls.commands);
        runner.run_all(&pulls.open);
    }

    let mut promoted = false;
    let mut prune = None;
    if let Some(release_config) = &release {
        if let Some(id) = &release_id {
            for item in &release_config.shared {
                runner.note(&format!("Linking shared item {}", item));
                if let Err(e) = release::link_shared(&tree, id, item) {
                    runner.fail(&format!("Cannot link {}: {}", item, e.describe()));
                }
            }
        }

        runner.run_all(&release_config.after);

        match &release_id {
            Some(id) => {
                runner.note(&format!("Linking release {}", id));
                release::promote(&tree, id)?;
                promoted = true;
                prune = prune_releases(&mut runner, &tree, release_config.keep_limit());
            }
            None => runner.run_all(&release_config.standalone),
        }
    }

    runner.run_all(&services.local.after);

    let live_url = live_url(&target, pulls, release.as_ref());
    let report = DeployReport {
        branch,
        pull_branch: request.pull_branch.clone(),
        tree: release_id.as_ref().map(|_| tree.root().to_path_buf()),
        release_id: release_id.clone(),
        promoted,
        prune,
        live_url,
        has_failure: runner.has_failure(),
        commands: runner.records().to_vec(),
        log_file,
        notified: Vec::new(),
    };

    let checkout = match &release_id {
        Some(id) if release.is_some() => tree.release_dir(id),
        _ => checkout,
    };

    Ok(Deployed {
        report,
        transcript: runner.transcript().to_string(),
        checkout,
        repo,
        release,
    })
}

fn finish(request: &DeploymentRequest, services: &Services, deployed: Deployed) -> DeployReport {
    let Deployed {
        mut report,
        transcript,
        checkout,
        repo,
        release,
    } = deployed;

    let (state, description) = if report.has_failure {
        (CommitState::Failure, FAILURE_DESCRIPTION)
    } else {
        (CommitState::Success, SUCCESS_DESCRIPTION)
    };
    services.report_status(request, state, report.live_url.as_deref(), Some(description));

    let Some(release) = release.filter(|_| !request.silent) else {
        return report;
    };

    let notification = Notification {
        subject: Notification::subject_for(release.name.as_deref()),
        body: transcript,
        emails: repo.emails.clone(),
        slack: repo.slack.clone(),
        release_name: release.name.clone(),
        live_url: report.live_url.clone(),
        last_commit: git::last_commit_message(&checkout),
    };
    report.notified = notify::dispatch(&services.notifiers, &notification);
    report
}

/// Set `TERM`, branch and pull-request variables.
///
/// Branch names come from the pushing client, so they are never expanded.
fn builtin_env(runner: &mut CommandRunner, request: &DeploymentRequest, branch: &str) {
    runner.set_env("TERM", "VT100");
    branch_env(runner, branch);
    if let Some(pull_branch) = &request.pull_branch {
        runner.set_env("PULL_BRANCH", pull_branch);
    }
    if let Some(pull_id) = &request.pull_id {
        runner.set_env("PULL_ID", pull_id);
    }
}

fn branch_env(runner: &mut CommandRunner, branch: &str) {
    runner.set_env("CURRENT_BRANCH", branch);
    runner.set_env("CURRENT_BRANCH_SANITIZED", &slugify::branch_env(branch));
}

fn prune_releases(
    runner: &mut CommandRunner,
    tree: &ReleaseTree,
    keep: Option<usize>,
) -> Option<PruneReport> {
    match release::prune(tree, keep) {
        Ok(report) => {
            for id in &report.pruned {
                runner.note(&format!("Removed extra release {}", id));
            }
            for id in &report.failed {
                runner.note(&format!("Could not remove release {}", id));
            }
            Some(report)
        }
        Err(e) => {
            runner.note(&format!("Pruning skipped: {}", e.describe()));
            None
        }
    }
}

fn live_url(
    target: &DeployTarget,
    pulls: Option<&PullsConfig>,
    release: Option<&ReleaseConfig>,
) -> Option<String> {
    if let DeployTarget::PullRequestRelease { dir_name, .. } = target {
        if let Some(url) = pulls.and_then(|p| p.url.as_deref()) {
            return Some(template::sprintf(url, &[dir_name]));
        }
    }
    release.and_then(|r| r.url.clone())
}

/// Contexts the CI gate requires, read from the most recently deployed
/// config of the target tree, then from the working directory.
fn required_contexts(request: &DeploymentRequest) -> Vec<String> {
    let candidates = [
        request.lock_root().join(release::CURRENT_LINK),
        request.working_dir.clone(),
    ];

    for dir in candidates {
        match config::load_repo_config(&dir) {
            Ok(repo) => {
                return repo.pulls.map(|p| p.statuses).unwrap_or_default();
            }
            Err(e) if e.code == ErrorCode::ConfigMissingFile => continue,
            Err(e) => {
                log_status!("ci", "Ignoring {}: {}", dir.display(), e.describe());
            }
        }
    }
    Vec::new()
}

/// Remove a fresh clone that will never become a release.
fn discard_checkout(request: &DeploymentRequest, checkout: &Path) {
    if request.clone_url.is_none() {
        return;
    }
    if let Err(e) = io::remove_any(checkout, "discard checkout") {
        log_status!("install", "Cannot remove {}: {}", checkout.display(), e.describe());
    }
}

/// Log file for a run, creating `<root>/logs`. None when that fails.
fn transcript_log(root: &Path, command: &str) -> Option<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    let path = paths::transcript_log(root, command, &timestamp);
    let parent = path.parent()?;
    match io::ensure_dir(parent, "create log directory") {
        Ok(()) => Some(path),
        Err(e) => {
            log_status!("install", "Transcript log disabled: {}", e.describe());
            None
        }
    }
}

// ============================================================================
// Clean
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CleanRequest {
    pub working_dir: PathBuf,
    /// Staging tree to remove; without it `working_dir` is the staging tree.
    pub pull_branch: Option<String>,
    /// Parent branch, selecting the config section.
    pub branch: String,
    pub silent: bool,
}

impl CleanRequest {
    /// Decode queue job args (`--dir`, `--pull-branch`, `--silent`, `branch`).
    pub fn from_job_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let mut request = CleanRequest {
            working_dir: PathBuf::from("."),
            ..CleanRequest::default()
        };

        for (raw_key, value) in args {
            let key = raw_key.trim_start_matches("--");
            match key {
                "dir" | "d" => request.working_dir = paths::expand_dir(value),
                "pull-branch" => request.pull_branch = non_empty(value),
                "branch" => request.branch = value.trim().to_string(),
                "silent" => request.silent = parse_flag(key, value)?,
                _ => log_status!("job", "Ignoring unknown argument '{}'", raw_key),
            }
        }

        if request.branch.is_empty() {
            return Err(Error::validation_missing_argument(vec!["branch".to_string()]));
        }
        Ok(request)
    }

    /// Staging tree to remove. Fails for pull branches that would resolve
    /// outside `pulls/`.
    pub fn staging_dir(&self) -> Result<PathBuf> {
        match &self.pull_branch {
            Some(pull_branch) => {
                Ok(paths::pulls(&self.working_dir).join(staging_dir_name(pull_branch)?))
            }
            None => Ok(self.working_dir.clone()),
        }
    }

    /// Directory holding CI records for this staging tree.
    pub fn records_dir(&self) -> Option<PathBuf> {
        if self.pull_branch.is_some() {
            return Some(self.working_dir.clone());
        }
        let parent = self.working_dir.parent()?;
        if parent.file_name()? == "pulls" {
            parent.parent().map(Path::to_path_buf)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    pub staging_dir: PathBuf,
    pub removed: bool,
    pub has_failure: bool,
    pub commands: Vec<CommandRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub swept_records: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notified: Vec<&'static str>,
}

pub fn clean(request: &CleanRequest, services: &Services) -> Result<CleanReport> {
    let staging = request.staging_dir()?;
    let log_file = if request.silent {
        None
    } else {
        request
            .records_dir()
            .and_then(|root| transcript_log(&root, "clean"))
    };

    let mut report = CleanReport {
        staging_dir: staging.clone(),
        removed: false,
        has_failure: false,
        commands: Vec::new(),
        swept_records: Vec::new(),
        notified: Vec::new(),
    };

    if staging.is_dir() {
        let repo = match config::load_repo_config(&staging.join(release::CURRENT_LINK)) {
            Ok(repo) => repo,
            Err(e) if e.code == ErrorCode::ConfigMissingFile => RepoConfig::default(),
            Err(e) => return Err(e),
        };

        let lock = services.locks.acquire(&staging, |event| {
            if let LockEvent::Waiting { path, .. } = event {
                log_status!("lock", "Waiting for {}", path.display());
            }
        })?;

        let mut runner = services.runner(&staging, log_file);
        branch_env(&mut runner, &request.branch);
        if let Some(pulls) = repo.pulls() {
            runner.run_all(&pulls.close);
        }

        // Removing the tree removes the lock file with it.
        lock.release();
        match io::remove_any(&staging, "remove staging tree") {
            Ok(()) => report.removed = true,
            Err(e) => runner.fail(&format!("Cannot remove {}: {}", staging.display(), e.describe())),
        }

        report.has_failure = runner.has_failure();
        report.commands = runner.records().to_vec();

        if !request.silent && !repo.emails.is_empty() {
            let name = repo
                .branch(&request.branch)
                .and_then(|s| s.release.as_ref())
                .and_then(|r| r.name.as_deref());
            let notification = Notification {
                subject: Notification::subject_for(name),
                body: runner.transcript().to_string(),
                emails: repo.emails.clone(),
                ..Notification::default()
            };
            report.notified = notify::dispatch(&services.notifiers, &notification);
        }
    } else {
        log_status!("clean", "Nothing to remove at {}", staging.display());
    }

    if let Some(records_dir) = request.records_dir() {
        report.swept_records = ci_gate::sweep(&records_dir);
    }

    Ok(report)
}

// ============================================================================
// Trigger
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReport {
    pub name: String,
    pub branch: String,
    pub has_failure: bool,
    pub commands: Vec<CommandRecord>,
}

pub fn trigger(dir: &Path, name: &str, services: &Services) -> Result<TriggerReport> {
    let repo = config::load_repo_config(dir)?;
    let commands = repo.trigger(name).ok_or_else(|| {
        Error::config_invalid_value(
            format!("triggers.{}", name),
            None,
            format!("Unknown trigger '{}'", name),
        )
    })?;

    let branch = git::head_branch(dir);
    let mut runner = services.runner(dir, None);
    branch_env(&mut runner, &branch);
    runner.run_all(commands);

    Ok(TriggerReport {
        name: name.to_string(),
        branch,
        has_failure: runner.has_failure(),
        commands: runner.records().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn services() -> Services {
        Services::offline(LocalConfig::default())
    }

    #[test]
    fn trigger_runs_named_commands_with_branch_env() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/feature/a\n").unwrap();
        fs::write(
            dir.path().join("hooks.yml"),
            "triggers:\n  cache:\n    - echo $CURRENT_BRANCH_SANITIZED\n",
        )
        .unwrap();

        let report = trigger(dir.path(), "cache", &services()).unwrap();

        assert_eq!(report.branch, "feature/a");
        assert_eq!(report.commands[0].output, "feature_a");
        assert!(!report.has_failure);
    }

    #[test]
    fn unknown_trigger_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hooks.yml"), "triggers: {}\n").unwrap();

        let err = trigger(dir.path(), "nope", &services()).unwrap_err();
        assert!(err.code.is_configuration());
    }

    #[test]
    fn in_place_install_runs_commands_and_standalone() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yml"),
            "all:\n  env:\n    - GREETING=hi\n  commands:\n    - echo $GREETING $CURRENT_BRANCH > out.txt\n  release:\n    standalone:\n      - echo standalone >> out.txt\n",
        )
        .unwrap();
        let mut request = DeploymentRequest::new(dir.path());
        request.branch = Some("main".to_string());
        request.silent = true;

        let outcome = install(&request, &services()).unwrap();

        let InstallOutcome::Deployed(report) = outcome else {
            panic!("expected a deploy");
        };
        assert!(!report.promoted);
        assert!(report.release_id.is_none());
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hi main\nstandalone\n"
        );
        assert!(!dir.path().join(".lock").exists());
        assert!(!dir.path().join("logs").exists());
    }

    #[test]
    fn branch_names_are_not_expanded_into_the_environment() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yml"),
            "all:\n  commands:\n    - printf '%s' \"$CURRENT_BRANCH\" > branch.txt\n",
        )
        .unwrap();
        let branch = "feat`touch PWNED`${HOME}";
        let mut request = DeploymentRequest::new(dir.path());
        request.branch = Some(branch.to_string());
        request.silent = true;

        install(&request, &services()).unwrap();

        assert!(!dir.path().join("PWNED").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("branch.txt")).unwrap(),
            branch
        );
    }

    #[test]
    fn install_rejects_dot_pull_branch_before_touching_disk() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hooks.yml"), "all:\n  commands:\n    - touch ran\n").unwrap();
        let mut request = DeploymentRequest::new(dir.path());
        request.branch = Some("main".to_string());
        request.pull_branch = Some("..".to_string());

        let err = install(&request, &services()).unwrap_err();

        assert_eq!(err.code, ErrorCode::ValidationInvalidArgument);
        assert!(!dir.path().join("ran").exists());
        assert!(!dir.path().join("pulls").exists());
    }

    #[test]
    fn missing_repo_config_aborts_before_commands() {
        let dir = tempdir().unwrap();
        let mut request = DeploymentRequest::new(dir.path());
        request.branch = Some("main".to_string());
        request.silent = true;

        let err = install(&request, &services()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissingFile);
        assert!(!dir.path().join(".lock").exists());
    }

    #[test]
    fn continuation_without_record_is_not_found() {
        let dir = tempdir().unwrap();
        let mut request = DeploymentRequest::new(dir.path());
        request.commit_sha = Some("abc123".to_string());

        let err = install(&request, &services()).unwrap_err();
        assert_eq!(err.code, ErrorCode::CiRecordNotFound);
    }

    #[test]
    fn clean_runs_close_hooks_and_removes_tree() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("pulls/feature-x");
        let release = staging.join("releases/20240101000000");
        fs::create_dir_all(&release).unwrap();
        fs::write(
            release.join("hooks.yml"),
            "pulls:\n  close:\n    - echo closing $CURRENT_BRANCH > ../../closed.txt\n",
        )
        .unwrap();
        std::os::unix::fs::symlink(&release, staging.join("current")).unwrap();
        fs::write(
            dir.path().join(".sha-abc"),
            format!(
                r#"{{"request":{{"workingDir":"{}"}},"dir":"{}"}}"#,
                dir.path().display(),
                staging.display()
            ),
        )
        .unwrap();

        let request = CleanRequest {
            working_dir: dir.path().to_path_buf(),
            pull_branch: Some("feature/x".to_string()),
            branch: "develop".to_string(),
            silent: true,
        };
        let report = clean(&request, &services()).unwrap();

        assert!(report.removed);
        assert!(!staging.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("closed.txt")).unwrap(),
            "closing develop\n"
        );
        assert_eq!(report.swept_records, vec!["abc"]);
    }

    #[test]
    fn clean_refuses_pull_branches_outside_pulls() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pulls/feature-x")).unwrap();
        fs::write(dir.path().join("precious.txt"), "live").unwrap();

        for pull_branch in ["..", ".", ".git"] {
            let request = CleanRequest {
                working_dir: dir.path().to_path_buf(),
                pull_branch: Some(pull_branch.to_string()),
                branch: "develop".to_string(),
                silent: true,
            };
            let err = clean(&request, &services()).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationInvalidArgument, "{}", pull_branch);
        }

        assert!(dir.path().join("precious.txt").is_file());
        assert!(dir.path().join("pulls/feature-x").is_dir());
    }

    #[test]
    fn clean_job_args_require_branch() {
        let args: BTreeMap<String, String> = [
            ("--dir".to_string(), "/srv/app".to_string()),
            ("--pull-branch".to_string(), "feature/x".to_string()),
            ("--silent".to_string(), "1".to_string()),
            ("branch".to_string(), "develop".to_string()),
        ]
        .into_iter()
        .collect();

        let request = CleanRequest::from_job_args(&args).unwrap();
        assert_eq!(request.working_dir, PathBuf::from("/srv/app"));
        assert_eq!(request.pull_branch.as_deref(), Some("feature/x"));
        assert!(request.silent);

        let err = CleanRequest::from_job_args(&BTreeMap::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationMissingArgument);
    }

    #[test]
    fn clean_request_resolves_records_dir() {
        let request = CleanRequest {
            working_dir: PathBuf::from("/srv/app/pulls/feature-x"),
            ..CleanRequest::default()
        };
        assert_eq!(
            request.staging_dir().unwrap(),
            PathBuf::from("/srv/app/pulls/feature-x")
        );
        assert_eq!(request.records_dir(), Some(PathBuf::from("/srv/app")));

        let request = CleanRequest {
            working_dir: PathBuf::from("/srv/app"),
            pull_branch: Some("feature/x".to_string()),
            ..CleanRequest::default()
        };
        assert_eq!(
            request.staging_dir().unwrap(),
            PathBuf::from("/srv/app/pulls/feature-x")
        );
    }
}
