use std::fs;
use std::path::Path;

use crate::utils::command;
use crate::utils::shell::{quote_arg, quote_path};

/// Branch assumed when `.git/HEAD` is missing or detached.
pub const DEFAULT_BRANCH: &str = "master";

const HEAD_REF_PREFIX: &str = "ref: refs/heads/";

// ============================================================================
// Command builders (run through the CommandRunner so they land in transcripts)
// ============================================================================

pub fn clone_command(url: &str, destination: &str) -> String {
    format!("git clone {} {}", quote_arg(url), quote_path(destination))
}

pub fn checkout_command(branch: &str) -> String {
    format!("git checkout {}", quote_arg(branch))
}

pub fn pull_command(branch: &str) -> String {
    format!("git pull origin {}", quote_arg(branch))
}

// ============================================================================
// Read-only queries
// ============================================================================

/// Branch checked out in `dir`, read from `.git/HEAD`.
pub fn head_branch(dir: &Path) -> String {
    fs::read_to_string(dir.join(".git").join("HEAD"))
        .ok()
        .and_then(|head| parse_head(&head))
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
}

fn parse_head(content: &str) -> Option<String> {
    let branch = content.trim().strip_prefix(HEAD_REF_PREFIX)?.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

/// Message of the last commit in `dir`, if it is a repository.
pub fn last_commit_message(dir: &Path) -> Option<String> {
    command::run_in_optional(dir, "git", &["log", "-1", "--pretty=%B"])
}
