pub mod shell;

use crate::{
    container::ResolvedContainer,
    queue::{ParameterError, TaskId, TaskParameters},
    secrets::{SecretsSnapshot, SECRET_NAMES},
};
use itertools::Itertools;
use shell::{CommandChain, Fragment, ShellCommand, Word};

pub const MEMORY: &str = "slurm/memory";
pub const TIME: &str = "slurm/time";
pub const CPU: &str = "slurm/cpu";
pub const GPU: &str = "slurm/gpu";
pub const LOG_DIR: &str = "slurm/log_dir";
pub const OVERLAY: &str = "slurm/singularity_overlay";
pub const BINDS: &str = "slurm/singularity_binds";

/// Directory inside the job's scratch space that artifact datasets are copied to
pub const CONTAINER_DIR: &str = "${SLURM_TMPDIR}/container_dir";
/// shell variable holding the `.sif` found in `CONTAINER_DIR`
const CONTAINER_IMAGE: &str = "CONTAINER_IMAGE";

/// Image used to run `clearml-data` when a container has to be fetched first
pub const DEFAULT_AGENT_IMAGE: &str = "docker://thewillyp/clearml-agent";

const JOB_NAME_PREFIX: &str = "clearml_";
const JOB_NAME_LENGTH: usize = 8;

/// Resource directives of one job, read from the task parameters at submission time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub memory: String,
    pub wall_clock_limit: String,
    pub cpu_count: u32,
    pub gpu_count: u32,
    pub log_directory: String,
    pub singularity: SingularityOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingularityOptions {
    /// writable overlay image, replaces the scratch bind over `$HOME`
    pub overlay: Option<String>,
    /// additional `src:dst` bind specs
    pub extra_binds: Vec<String>,
}

/// sbatch directives are not shell-parsed, a line break would start a new script line
fn directive_value<'a>(
    parameters: &'a TaskParameters,
    key: &str,
) -> Result<&'a str, ParameterError> {
    let value = parameters.require(key)?.trim();

    if value.chars().any(char::is_control) {
        Err(ParameterError::Invalid {
            key: key.to_string(),
            value: value.escape_default().to_string(),
        })
    } else {
        Ok(value)
    }
}

impl ResourceSpec {
    pub fn from_parameters(parameters: &TaskParameters) -> Result<Self, ParameterError> {
        let extra_binds = parameters
            .get(BINDS)
            .map(|binds| {
                binds
                    .split(',')
                    .map(str::trim)
                    .filter(|bind| !bind.is_empty())
                    .map(String::from)
                    .collect_vec()
            })
            .unwrap_or_default();

        Ok(Self {
            memory: directive_value(parameters, MEMORY)?.to_string(),
            wall_clock_limit: directive_value(parameters, TIME)?.to_string(),
            cpu_count: parameters.parse(CPU)?,
            gpu_count: parameters.parse_or(GPU, 0)?,
            log_directory: directive_value(parameters, LOG_DIR)?
                .trim_end_matches('/')
                .to_string(),
            singularity: SingularityOptions {
                overlay: parameters.get(OVERLAY).map(|overlay| overlay.trim().to_string()),
                extra_binds,
            },
        })
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Which queued task a job executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    pub task_id: TaskId,
    pub task_name: String,
}

impl JobIdentity {
    /// `clearml_` plus the first characters of the task name, restricted to a safe charset
    pub fn job_name(&self) -> String {
        let suffix: String = self
            .task_name
            .chars()
            .take(JOB_NAME_LENGTH)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        format!("{JOB_NAME_PREFIX}{suffix}")
    }
}

/// Rendered, self-contained batch script for one queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPlan {
    pub task_id: TaskId,
    pub job_name: String,
    pub script: String,
    pub stdout_log: String,
    pub stderr_log: String,
}

#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    agent_image: String,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_IMAGE)
    }
}

impl ScriptBuilder {
    pub fn new(agent_image: impl Into<String>) -> Self {
        Self {
            agent_image: agent_image.into(),
        }
    }

    pub fn build(
        &self,
        resources: &ResourceSpec,
        container: &ResolvedContainer,
        identity: &JobIdentity,
        secrets: &SecretsSnapshot,
    ) -> SubmissionPlan {
        let stdout_log = format!("{}/run-%j-{}.log", resources.log_directory, identity.task_id);
        let stderr_log = format!("{}/run-%j-{}.err", resources.log_directory, identity.task_id);
        let job_name = identity.job_name();

        let mut script = String::from("#!/bin/bash\n");
        let mut directive = |line: String| {
            script.push_str("#SBATCH ");
            script.push_str(&line);
            script.push('\n');
        };

        directive(format!("--job-name={job_name}"));
        directive("--nodes=1".to_string());
        directive("--ntasks=1".to_string());
        directive(format!("--mem={}", resources.memory));
        directive(format!("--time={}", resources.wall_clock_limit));
        directive(format!("--cpus-per-task={}", resources.cpu_count));
        directive(format!("--output={stdout_log}"));
        directive(format!("--error={stderr_log}"));
        if resources.uses_gpu() {
            directive(format!("--gres=gpu:{}", resources.gpu_count));
        }

        script.push('\n');
        script.push_str(&format!(
            "export CLEARML_TASK_ID={}\n",
            shell::quote(&identity.task_id.0)
        ));
        for (name, value) in secrets.exports() {
            script.push_str(&format!("export {name}={}\n", shell::quote(value)));
        }

        script.push_str(concat!(
            "\n",
            "# Stage SSH credentials into scratch for outbound SSH from inside the container\n",
            "mkdir -p \"${SLURM_TMPDIR}/.ssh\"\n",
            "cp -r \"${HOME}\"/.ssh/* \"${SLURM_TMPDIR}/.ssh/\"\n",
            "chmod 700 \"${SLURM_TMPDIR}/.ssh\"\n",
            "chmod 600 \"${SLURM_TMPDIR}\"/.ssh/*\n",
            "\n",
        ));

        script.push_str(&self.execution(resources, container, identity).render());
        script.push('\n');

        SubmissionPlan {
            task_id: identity.task_id.clone(),
            job_name,
            script,
            stdout_log,
            stderr_log,
        }
    }

    /// commands that run the agent for `identity` inside `container`
    pub fn execution(
        &self,
        resources: &ResourceSpec,
        container: &ResolvedContainer,
        identity: &JobIdentity,
    ) -> CommandChain {
        match container {
            ResolvedContainer::Image(reference) => CommandChain::new(self.run_command(
                resources,
                Word::literal(reference.as_str()),
                identity,
            )),
            ResolvedContainer::Dataset { id } => {
                let locate = ShellCommand::new("find")
                    .word(Word::expand("\"${SLURM_TMPDIR}/container_dir\""))
                    .option("-name", Word::literal("*.sif"))
                    .pipe(ShellCommand::new("head").flag("-n").flag("1"));
                let image = Word::fragments(vec![Fragment::ExpandOwned(format!(
                    "\"${{{CONTAINER_IMAGE}:?no .sif image found in {CONTAINER_DIR}}}\""
                ))]);
                let run = ShellCommand::assign(
                    CONTAINER_IMAGE,
                    Word::fragments(vec![Fragment::Substitute(locate)]),
                )
                .and(self.run_command(resources, image, identity));

                CommandChain::new(self.fetch_command(id)).then(run)
            }
        }
    }

    fn fetch_command(&self, dataset_id: &str) -> ShellCommand {
        let command = ShellCommand::new("singularity")
            .flag("exec")
            .flag("--containall")
            .flag("--cleanenv")
            .option("--bind", Word::expand("${SLURM_TMPDIR}"));

        pass_environment(command, false)
            .arg(self.agent_image.as_str())
            .flag("clearml-data")
            .flag("get")
            .option("--id", Word::literal(dataset_id))
            .option("--copy", Word::expand(CONTAINER_DIR))
    }

    fn run_command(
        &self,
        resources: &ResourceSpec,
        image: Word,
        identity: &JobIdentity,
    ) -> ShellCommand {
        let options = &resources.singularity;
        let mut binds = vec![Word::expand("${SLURM_TMPDIR}:/tmp")];

        if options.overlay.is_none() {
            binds.push(Word::expand("${SLURM_TMPDIR}:${HOME}"));
        }
        binds.extend(options.extra_binds.iter().map(|bind| Word::literal(bind.as_str())));

        let mut command = ShellCommand::new("singularity")
            .flag("exec")
            .flag_if(resources.uses_gpu(), "--nv")
            .flag("--containall")
            .flag("--cleanenv");

        if let Some(overlay) = &options.overlay {
            command = command.option(
                "--overlay",
                Word::fragments(vec![
                    Fragment::Literal(overlay.clone()),
                    Fragment::Expand(":rw"),
                ]),
            );
        }

        pass_environment(command.option("--bind", Word::joined(binds, ",")), true)
            .word(image)
            .flag("clearml-agent")
            .flag("execute")
            .option("--id", Word::literal(identity.task_id.0.as_str()))
    }
}

/// forward the exported credentials (and optionally the task id) into a `--cleanenv` container
fn pass_environment(mut command: ShellCommand, with_task_id: bool) -> ShellCommand {
    let names = SECRET_NAMES
        .iter()
        .copied()
        .chain(with_task_id.then_some("CLEARML_TASK_ID"));

    for name in names {
        let passthrough = Fragment::ExpandOwned(format!("{name}=${name}"));
        command = command.option("--env", Word::fragments(vec![passthrough]));
    }

    command
}
