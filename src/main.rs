use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{clean, install, trigger, worker};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hooks")]
#[command(version = VERSION)]
#[command(about = "Git deploy hooks: release trees, CI-gated staging and a queue worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install documented hooks
    Install(install::InstallArgs),
    /// Clean a pull request staging tree
    Clean(clean::CleanArgs),
    /// Run a named trigger from hooks.yml
    Trigger(trigger::TriggerArgs),
    /// Wait for one queued job and run it
    #[command(name = "worker:job")]
    WorkerJob(worker::WorkerJobArgs),
    /// Bump the worker version so running workers retire
    #[command(name = "worker:incr")]
    WorkerIncr(worker::WorkerIncrArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let (json_result, exit_code) = commands::run_json(cli.command);
    if let Err(e) = output::print_json_result(json_result) {
        eprintln!("{}", e.describe());
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
