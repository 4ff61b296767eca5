use clap::Args;
use serde::Serialize;

use hooks::config;
use hooks::pipeline::{self, Services};
use hooks::queue::{Job, JobKind, JobQueue, RedisQueue};
use hooks::worker::{JobDispatcher, Worker, WorkerExit};
use hooks::{CleanRequest, DeploymentRequest};

use super::CmdResult;

#[derive(Args)]
pub struct WorkerJobArgs {
    /// Redis host
    #[arg(long)]
    pub host: Option<String>,

    /// Redis port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Redis database
    #[arg(long)]
    pub db: Option<i64>,

    /// Queue name
    #[arg(long)]
    pub queue: Option<String>,
}

#[derive(Args)]
pub struct WorkerIncrArgs {
    /// Redis host
    #[arg(long)]
    pub host: Option<String>,

    /// Redis port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Redis database
    #[arg(long)]
    pub db: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct IncrOutput {
    pub version: i64,
}

/// Routes jobs into the install and clean pipelines.
struct PipelineDispatcher<'a> {
    services: &'a Services,
}

impl JobDispatcher for PipelineDispatcher<'_> {
    fn dispatch(&mut self, job: &Job) -> hooks::Result<()> {
        match job.kind() {
            JobKind::Install => {
                let request = DeploymentRequest::from_job_args(&job.args)?;
                pipeline::install(&request, self.services).map(|_| ())
            }
            JobKind::Clean => {
                let request = CleanRequest::from_job_args(&job.args)?;
                pipeline::clean(&request, self.services).map(|_| ())
            }
        }
    }
}

pub fn run(args: WorkerJobArgs) -> CmdResult<WorkerExit> {
    let local = config::load_local_config();
    let daemon = local
        .daemon
        .clone()
        .with_overrides(args.host, args.port, args.db, args.queue);
    let services = Services::from_local_config(local)?;

    let mut worker = Worker::new(RedisQueue::connect(&daemon)?);
    let token = worker.start()?;
    let mut dispatcher = PipelineDispatcher {
        services: &services,
    };
    let exit = worker.run(&token, &mut dispatcher)?;
    Ok((exit, 0))
}

pub fn run_incr(args: WorkerIncrArgs) -> CmdResult<IncrOutput> {
    let local = config::load_local_config();
    let daemon = local
        .daemon
        .with_overrides(args.host, args.port, args.db, None);

    let mut queue = RedisQueue::connect(&daemon)?;
    let version = queue.incr_version()?;
    Ok((IncrOutput { version }, 0))
}
