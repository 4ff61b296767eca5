use clap::Args;

use hooks::paths;
use hooks::pipeline::{self, CleanReport};
use hooks::CleanRequest;

use super::CmdResult;

#[derive(Args)]
pub struct CleanArgs {
    /// Working directory (or the staging tree itself without --pull-branch)
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: String,

    /// Pull request branch whose staging tree is removed
    #[arg(long)]
    pub pull_branch: Option<String>,

    /// No notification
    #[arg(long)]
    pub silent: bool,

    /// Parent branch name
    pub branch: String,
}

pub fn run(args: CleanArgs) -> CmdResult<CleanReport> {
    let services = super::services()?;
    let request = CleanRequest {
        working_dir: paths::expand_dir(&args.dir),
        pull_branch: args.pull_branch,
        branch: args.branch,
        silent: args.silent,
    };
    let report = pipeline::clean(&request, &services)?;
    Ok((report, 0))
}
