use clap::Args;

use hooks::paths;
use hooks::pipeline::{self, TriggerReport};

use super::CmdResult;

#[derive(Args)]
pub struct TriggerArgs {
    /// Working directory
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: String,

    /// Trigger name
    pub name: String,
}

pub fn run(args: TriggerArgs) -> CmdResult<TriggerReport> {
    let services = super::services()?;
    let report = pipeline::trigger(&paths::expand_dir(&args.dir), &args.name, &services)?;
    Ok((report, 0))
}
