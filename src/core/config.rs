//! Typed configuration: the per-repository `hooks.yml` and the local
//! `$HOME/.hooks.yml` user config.
//!
//! Repository config is mandatory for a deploy and any problem with it is a
//! configuration error. The local config is optional; a missing or unreadable
//! file falls back to defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::io;

/// Branch section used when no section matches the deployed branch.
pub const FALLBACK_BRANCH_SECTION: &str = "all";

// =============================================================================
// Repository config (hooks.yml)
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulls: Option<PullsConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub triggers: BTreeMap<String, Vec<String>>,

    /// Every other top-level key is a branch name (or `all`).
    #[serde(flatten)]
    pub branches: BTreeMap<String, BranchConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    #[serde(default)]
    pub commands: Vec<String>,

    /// Ordered `NAME=VALUE` entries; values support `${VAR}` and backticks.
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Release tree location relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Number of releases to retain. Absent or `<= 0` keeps everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<i64>,

    /// Paths (relative to the release root) linked to `shared/`.
    #[serde(default)]
    pub shared: Vec<String>,

    /// Commands run after shared links are in place, before promotion.
    #[serde(default)]
    pub after: Vec<String>,

    /// Commands run instead of promotion for in-place (no clone) installs.
    #[serde(default)]
    pub standalone: Vec<String>,
}

impl ReleaseConfig {
    pub fn keep_limit(&self) -> Option<usize> {
        match self.keep {
            Some(n) if n > 0 => Some(n as usize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullsConfig {
    #[serde(default)]
    pub open: Vec<String>,

    #[serde(default)]
    pub close: Vec<String>,

    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default)]
    pub env: Vec<String>,

    /// Release settings for staging trees, overriding the branch release section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseConfig>,

    /// Required CI contexts. Empty means every reported context must pass.
    #[serde(default)]
    pub statuses: Vec<String>,

    /// printf template for the staging URL; `%s` receives the staging dir name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl SlackConfig {
    /// Webhook URL and channel, when both are configured.
    pub fn target(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.channel.as_deref()) {
            (Some(url), Some(channel)) if !url.is_empty() && !channel.is_empty() => {
                Some((url, channel))
            }
            _ => None,
        }
    }
}

impl RepoConfig {
    /// Section for `branch`, falling back to the `all` section.
    pub fn branch(&self, branch: &str) -> Option<&BranchConfig> {
        self.branches
            .get(branch)
            .or_else(|| self.branches.get(FALLBACK_BRANCH_SECTION))
    }

    pub fn pulls(&self) -> Option<&PullsConfig> {
        self.pulls.as_ref()
    }

    pub fn trigger(&self, name: &str) -> Option<&[String]> {
        self.triggers.get(name).map(Vec::as_slice)
    }

    /// Reject values the pipeline cannot act on safely.
    pub fn validate(&self) -> Result<()> {
        for (name, section) in &self.branches {
            if let Some(release) = &section.release {
                validate_release(&format!("{}.release", name), release)?;
            }
        }
        if let Some(release) = self.pulls.as_ref().and_then(|p| p.release.as_ref()) {
            validate_release("pulls.release", release)?;
        }
        Ok(())
    }
}

fn validate_release(key: &str, release: &ReleaseConfig) -> Result<()> {
    if let Some(dir) = &release.directory {
        validate_relative(&format!("{}.directory", key), dir)?;
    }
    for item in &release.shared {
        validate_relative(&format!("{}.shared", key), item)?;
    }
    Ok(())
}

fn validate_relative(key: &str, value: &str) -> Result<()> {
    let trimmed = value.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::config_invalid_value(
            key,
            Some(value.to_string()),
            format!("{} cannot be empty", key),
        ));
    }
    if Path::new(trimmed)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config_invalid_value(
            key,
            Some(value.to_string()),
            format!("{} must stay inside the release tree", key),
        ));
    }
    Ok(())
}

/// Parse repository config content. `origin` names the source in errors.
pub fn parse_repo_config(content: &str, origin: &str) -> Result<RepoConfig> {
    if content.trim().is_empty() {
        return Ok(RepoConfig::default());
    }

    let config: RepoConfig = serde_yml::from_str(content)
        .map_err(|e| Error::config_invalid_yaml(origin, e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load `hooks.yml` from a checkout directory.
pub fn load_repo_config(checkout: &Path) -> Result<RepoConfig> {
    let path = paths::repo_config(checkout);
    if !path.is_file() {
        return Err(Error::config_missing_file(path.display().to_string()));
    }

    let content = io::read_file(&path, "read repository config")?;
    parse_repo_config(&content, &path.display().to_string())
}

// =============================================================================
// Local user config ($HOME/.hooks.yml)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub github: GithubConfig,

    #[serde(default = "default_messages")]
    pub messages: Vec<String>,

    /// Commands run after every install, whatever the repository.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            email: EmailConfig::default(),
            github: GithubConfig::default(),
            messages: default_messages(),
            after: Vec::new(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Status context this tool reports under; ignored when gating.
    #[serde(default = "default_github_context")]
    pub context: String,

    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: None,
            context: default_github_context(),
            api_url: default_github_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,

    #[serde(default = "default_daemon_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    #[serde(default = "default_daemon_queue")]
    pub queue: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            db: 0,
            queue: default_daemon_queue(),
        }
    }
}

impl DaemonConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    /// Apply CLI overrides on top of the configured values.
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        db: Option<i64>,
        queue: Option<String>,
    ) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(db) = db {
            self.db = db;
        }
        if let Some(queue) = queue {
            self.queue = queue;
        }
        self
    }
}

fn default_messages() -> Vec<String> {
    vec!["New release".to_string()]
}

fn default_github_context() -> String {
    "hooks".to_string()
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    6379
}

fn default_daemon_queue() -> String {
    "jobs".to_string()
}

/// Load the local config from an explicit path, falling back to defaults.
pub fn load_local_config_from(path: &Path) -> LocalConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return LocalConfig::default(),
    };

    match serde_yml::from_str::<LocalConfig>(&content) {
        Ok(mut config) => {
            if config.messages.is_empty() {
                config.messages = default_messages();
            }
            config
        }
        Err(e) => {
            log_status!("config", "Ignoring {}: {}", path.display(), e);
            LocalConfig::default()
        }
    }
}

/// Load `$HOME/.hooks.yml`, falling back to defaults.
pub fn load_local_config() -> LocalConfig {
    match paths::local_config() {
        Ok(path) => load_local_config_from(&path),
        Err(_) => LocalConfig::default(),
    }
}
