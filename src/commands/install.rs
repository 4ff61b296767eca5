use clap::Args;

use hooks::paths;
use hooks::pipeline::{self, InstallOutcome};
use hooks::DeploymentRequest;

use super::CmdResult;

#[derive(Args)]
pub struct InstallArgs {
    /// Working directory
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: String,

    /// Git clone URL
    #[arg(long, short = 'u')]
    pub url: Option<String>,

    /// Pull request branch name
    #[arg(long)]
    pub pull_branch: Option<String>,

    /// Commit SHA used for CI statuses
    #[arg(long)]
    pub pull_sha: Option<String>,

    /// Repository (`owner/name`) used for CI statuses
    #[arg(long)]
    pub pull_repository: Option<String>,

    /// Deploy even if CI checks are not green
    #[arg(long)]
    pub pull_force: bool,

    /// Pull request number
    #[arg(long)]
    pub pull_id: Option<String>,

    /// Pull the branch before running commands (in-place installs)
    #[arg(long)]
    pub update: bool,

    /// No notification
    #[arg(long)]
    pub silent: bool,

    /// Branch name (defaults to the checked out branch)
    pub branch: Option<String>,
}

impl InstallArgs {
    fn into_request(self) -> DeploymentRequest {
        DeploymentRequest {
            branch: self.branch,
            clone_url: self.url,
            pull_branch: self.pull_branch,
            pull_id: self.pull_id,
            pull_repository: self.pull_repository,
            commit_sha: self.pull_sha,
            working_dir: paths::expand_dir(&self.dir),
            silent: self.silent,
            force: self.pull_force,
            update: self.update,
        }
    }
}

pub fn run(args: InstallArgs) -> CmdResult<InstallOutcome> {
    let services = super::services()?;
    let request = args.into_request();
    let outcome = pipeline::install(&request, &services)?;
    Ok((outcome, 0))
}
