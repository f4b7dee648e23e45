use super::{RemoteExecutionError, RemoteShell};
use crate::script::{
    shell::{ShellCommand, Word},
    SubmissionPlan,
};
use std::fmt;
use tracing::{info, instrument, warn};

const SUBMITTED_PREFIX: &str = "Submitted batch job ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlurmJobId(pub u64);

impl fmt::Display for SlurmJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The batch scheduler as seen by the controller
pub trait ClusterScheduler {
    /// authoritative number of jobs the controller's user currently has queued or running
    fn running_jobs(&self) -> Result<usize, RemoteExecutionError>;

    /// submit a rendered script, returning the job id if the scheduler reported one
    fn submit(&self, plan: &SubmissionPlan) -> Result<Option<SlurmJobId>, RemoteExecutionError>;
}

/// Slurm reached through a remote shell on the head-node
#[derive(Debug, Clone)]
pub struct SlurmScheduler<S> {
    shell: S,
    user: String,
}

impl<S: RemoteShell> SlurmScheduler<S> {
    pub fn new(shell: S, user: impl Into<String>) -> Self {
        Self {
            shell,
            user: user.into(),
        }
    }

    /// `squeue` alone, so its exit status reaches us instead of a pipe's
    fn count_command(&self) -> String {
        ShellCommand::new("squeue")
            .flag("--noheader")
            .option("--user", Word::literal(self.user.as_str()))
            .render()
    }
}

/// one row per job; every row starts with the job id
fn count_jobs(command: String, output: String) -> Result<usize, RemoteExecutionError> {
    let is_row = |row: &&str| !row.trim().is_empty();
    let malformed = output
        .lines()
        .filter(is_row)
        .any(|row| !row.trim_start().starts_with(|c: char| c.is_ascii_digit()));

    if malformed {
        return Err(RemoteExecutionError::InvalidOutput { command, output });
    }

    Ok(output.lines().filter(is_row).count())
}

/// parse the job id out of `sbatch` output, e.g. `Submitted batch job 4242`
pub fn parse_job_id(output: &str) -> Option<SlurmJobId> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(SUBMITTED_PREFIX))
        .and_then(|id| id.split_whitespace().next())
        .and_then(|id| id.parse().ok())
        .map(SlurmJobId)
}

impl<S: RemoteShell> ClusterScheduler for SlurmScheduler<S> {
    #[instrument(level = "debug", skip(self), fields(user = %self.user))]
    fn running_jobs(&self) -> Result<usize, RemoteExecutionError> {
        let command = self.count_command();
        let output = self.shell.run(&command, None)?;

        count_jobs(command, output)
    }

    #[instrument(level = "debug", skip(self, plan), fields(task = %plan.task_id))]
    fn submit(&self, plan: &SubmissionPlan) -> Result<Option<SlurmJobId>, RemoteExecutionError> {
        let output = self.shell.run("sbatch", Some(&plan.script))?;

        match parse_job_id(&output) {
            Some(job) => {
                info!(task = %plan.task_id, job = %job, log = %plan.stdout_log, "Submitted Slurm job");

                Ok(Some(job))
            }
            None => {
                warn!(task = %plan.task_id, output = %output.trim(), "sbatch succeeded without reporting a job id");

                Ok(None)
            }
        }
    }
}
