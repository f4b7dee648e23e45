//! slurm-glue - drains a ClearML queue into Slurm without exceeding a job ceiling

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slurm_glue::{
    config::{ConfigErrors, ControllerConfig},
    controller::{
        AdmissionSettings, Collaborators, Controller, SubmissionError, ThreadSleeper,
    },
    queue::{clearml::ClearmlClient, QueueError, TaskId},
    remote::{slurm::SlurmScheduler, SshExecutor},
    script::ScriptBuilder,
    secrets::{SecretsError, SecretsSnapshot},
};

#[derive(Parser, Debug)]
#[command(name = "slurm-glue", version, about, long_about = None)]
struct Cli {
    /// Path to the controller configuration (YAML), defaults apply when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// YAML file of secrets, taking precedence over the environment
    #[arg(long = "secrets")]
    secrets: Option<PathBuf>,

    /// ID of the controller's own ClearML task; its `slurm/queue_name`, `slurm/max_jobs`
    /// and `slurm/lazy_poll_interval` parameters override the config file
    #[arg(long)]
    controller_task: Option<String>,

    /// Log filter, e.g. `debug` or `slurm_glue=trace`; defaults to RUST_LOG, then `info`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the queue and submit jobs until terminated
    Run {
        /// Stop after this many poll iterations
        #[arg(long)]
        iterations: Option<usize>,
    },

    /// Print the batch script for a task without dequeuing or submitting it
    Render {
        /// ID of the queued task
        task_id: String,
    },

    /// Validate the configuration and the secrets, then exit
    Check,
}

#[derive(Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Secrets(#[from] SecretsError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn execute(cli: Cli) -> Result<(), StartupError> {
    let mut config = ControllerConfig::load(cli.config.as_deref())?;
    let secrets = SecretsSnapshot::load(cli.secrets.as_deref())?;
    let api_host = config.api_host(&secrets);

    let clearml = ClearmlClient::new(
        &api_host,
        secrets.clearml_access_key.as_str(),
        secrets.clearml_secret_key.as_str(),
        config.request_timeout(),
    )?;

    if let Some(task) = &cli.controller_task {
        config.apply_controller_task(&clearml, &TaskId(task.clone()))?;
    }

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let head_node = config.head_node()?;
    let user = config.cluster_user()?;

    if let Commands::Check = cli.command {
        info!(
            queue = %config.queue_name,
            max_jobs = config.max_jobs,
            head_node = %head_node,
            user = %user,
            api_host = %api_host,
            "Configuration and secrets are valid"
        );
        return Ok(());
    }

    let scheduler = SlurmScheduler::new(SshExecutor::new(head_node, config.ssh_timeout()), user);
    let sleeper = ThreadSleeper;

    let mut controller = Controller::new(
        Collaborators {
            queue: &clearml,
            registry: &clearml,
            scheduler: &scheduler,
            sleeper: &sleeper,
        },
        &config.queue_name,
        AdmissionSettings {
            ceiling: config.max_jobs,
            poll_interval: config.poll_interval(),
        },
        ScriptBuilder::new(config.agent_image.as_str()),
        secrets,
    )?;

    match cli.command {
        Commands::Run {
            iterations: Some(iterations),
        } => {
            let totals = controller.run_for(iterations);
            info!(
                submitted = totals.submitted,
                failed = totals.failed,
                "Finished {iterations} iterations"
            );
            Ok(())
        }
        Commands::Run { iterations: None } => controller.run(),
        Commands::Render { task_id } => {
            let plan = controller.plan(&TaskId(task_id))?;
            print!("{}", plan.script);
            Ok(())
        }
        Commands::Check => Ok(()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "Controller stopped");
            ExitCode::FAILURE
        }
    }
}
