pub type CmdResult<T> = hooks::Result<(T, i32)>;

pub mod clean;
pub mod install;
pub mod trigger;
pub mod worker;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args))
    };
}

pub(crate) fn run_json(command: crate::Commands) -> (hooks::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Install(args) => dispatch!(args, install),
        crate::Commands::Clean(args) => dispatch!(args, clean),
        crate::Commands::Trigger(args) => dispatch!(args, trigger),
        crate::Commands::WorkerJob(args) => dispatch!(args, worker),
        crate::Commands::WorkerIncr(args) => {
            crate::output::map_cmd_result_to_json(worker::run_incr(args))
        }
    }
}

/// Services wired from `$HOME/.hooks.yml`.
pub(crate) fn services() -> hooks::Result<hooks::Services> {
    hooks::Services::from_local_config(hooks::config::load_local_config())
}
