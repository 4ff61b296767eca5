use crate::error::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the per-repository configuration file at the checkout root.
pub const REPO_CONFIG_FILE: &str = "hooks.yml";

/// Prefix of persisted CI-gate records inside a target directory.
pub const SHA_RECORD_PREFIX: &str = ".sha-";

/// User home directory.
pub fn home() -> Result<PathBuf> {
    let home = env::var("HOME").map_err(|_| {
        Error::internal_unexpected("HOME environment variable not set".to_string())
    })?;
    Ok(PathBuf::from(home))
}

/// Local user config file ($HOME/.hooks.yml)
pub fn local_config() -> Result<PathBuf> {
    Ok(home()?.join(".hooks.yml"))
}

/// Repository config file inside a checkout
pub fn repo_config(checkout: &Path) -> PathBuf {
    checkout.join(REPO_CONFIG_FILE)
}

/// Lock file of a release tree
pub fn lock_file(tree_root: &Path) -> PathBuf {
    tree_root.join(".lock")
}

/// Persisted CI-gate record for a commit
pub fn sha_record(dir: &Path, sha: &str) -> PathBuf {
    dir.join(format!("{}{}", SHA_RECORD_PREFIX, sha))
}

/// Pull-request staging trees directory
pub fn pulls(base: &Path) -> PathBuf {
    base.join("pulls")
}

/// Transcript log file for one command run
pub fn transcript_log(root: &Path, command: &str, timestamp: &str) -> PathBuf {
    root.join("logs").join(format!("{}-{}.log", command, timestamp))
}

/// Expand a leading `~` in a user-supplied directory.
pub fn expand_dir(dir: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(dir).into_owned())
}
