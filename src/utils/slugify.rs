//! Branch name sanitization.

/// Directory-safe form of a branch name (`feature/login` -> `feature-login`).
pub fn branch_dir(branch: &str) -> String {
    branch.trim().replace('/', "-")
}

/// Environment-safe form of a branch name (`feature/login` -> `feature_login`).
pub fn branch_env(branch: &str) -> String {
    branch.trim().replace('/', "_")
}
