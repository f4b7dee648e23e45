//! Fakes for the controller's collaborators, shared by the unit tests

use crate::{
    container::{DatasetRegistry, SOURCE_DOCKER_URL, SOURCE_TYPE},
    controller::Sleeper,
    queue::{QueueEntry, QueueError, QueueId, QueuePlatform, TaskId, TaskParameters},
    remote::{
        slurm::{ClusterScheduler, SlurmJobId},
        RemoteExecutionError, RemoteShell,
    },
    script::{JobIdentity, SubmissionPlan, CPU, GPU, LOG_DIR, MEMORY, TIME},
    secrets::SecretsSnapshot,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

pub fn secrets() -> SecretsSnapshot {
    SecretsSnapshot {
        aws_access_key_id: "AKIAEXAMPLE".to_string(),
        aws_secret_access_key: "secret with spaces".to_string(),
        aws_default_region: "us-east-1".to_string(),
        clearml_api_host: "https://api.clear.ml".to_string(),
        clearml_web_host: "https://app.clear.ml".to_string(),
        clearml_files_host: "https://files.clear.ml".to_string(),
        clearml_access_key: "access".to_string(),
        clearml_secret_key: "s3cr3t$".to_string(),
    }
}

/// task parameters for a docker based job with `gpus` GPUs
pub fn parameters(name: &str, gpus: u32) -> TaskParameters {
    TaskParameters::new(name)
        .with(MEMORY, "8GB")
        .with(TIME, "00:30:00")
        .with(CPU, "4")
        .with(GPU, gpus.to_string())
        .with(LOG_DIR, "/vast/logs/")
        .with(SOURCE_TYPE, "docker_url")
        .with(SOURCE_DOCKER_URL, "docker://thewillyp/devenv:cpu")
}

pub fn identity() -> JobIdentity {
    JobIdentity {
        task_id: TaskId("task-0001".to_string()),
        task_name: "train-resnet-50".to_string(),
    }
}

pub fn plan(task: &str) -> SubmissionPlan {
    SubmissionPlan {
        task_id: TaskId(task.to_string()),
        job_name: "clearml_train".to_string(),
        script: format!("#!/bin/bash\necho {task}\n"),
        stdout_log: format!("/vast/logs/run-%j-{task}.log"),
        stderr_log: format!("/vast/logs/run-%j-{task}.err"),
    }
}

#[derive(Debug, Default)]
pub struct FakeRegistry {
    datasets: BTreeMap<(String, String), String>,
    lookups: Mutex<Vec<(String, String)>>,
}

impl FakeRegistry {
    pub fn with_dataset(mut self, project: &str, name: &str, id: &str) -> Self {
        self.datasets
            .insert((project.to_string(), name.to_string()), id.to_string());
        self
    }

    pub fn lookups(&self) -> Vec<(String, String)> {
        self.lookups.lock().clone()
    }
}

impl DatasetRegistry for FakeRegistry {
    fn dataset_id(&self, project: &str, name: &str) -> Result<String, QueueError> {
        let key = (project.to_string(), name.to_string());
        self.lookups.lock().push(key.clone());

        self.datasets
            .get(&key)
            .cloned()
            .ok_or_else(|| QueueError::InvalidResponse {
                endpoint: "tasks.get_all",
                message: format!("no dataset {project}/{name}"),
            })
    }
}

type Call = (String, Option<String>);

/// Remote shell that replays canned responses in order and records every call
#[derive(Debug, Clone, Default)]
pub struct ScriptedShell {
    responses: Arc<Mutex<VecDeque<Result<String, RemoteExecutionError>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedShell {
    pub fn respond(self, response: Result<String, RemoteExecutionError>) -> Self {
        self.responses.lock().push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

impl RemoteShell for ScriptedShell {
    fn run(&self, command: &str, stdin: Option<&str>) -> Result<String, RemoteExecutionError> {
        self.calls
            .lock()
            .push((command.to_string(), stdin.map(String::from)));

        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Queue holding a fixed backlog; the reported depth can differ from the real one
#[derive(Debug, Default)]
pub struct FakeQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    parameters: BTreeMap<TaskId, TaskParameters>,
    reported_depth: Option<usize>,
    fail_depth: bool,
    fail_dequeue: bool,
    pub depth_queries: Mutex<usize>,
    pub dequeues: Mutex<usize>,
}

impl FakeQueue {
    pub fn with_tasks(tasks: usize) -> Self {
        let mut queue = Self::default();

        for index in 0..tasks {
            queue = queue.push(parameters(&format!("task-{index}"), 0));
        }

        queue
    }

    /// enqueue a task whose id is derived from its position
    pub fn push(mut self, parameters: TaskParameters) -> Self {
        let task = TaskId(format!("id-{}", self.parameters.len()));

        self.entries.lock().push_back(QueueEntry {
            task: task.clone(),
            added: None,
        });
        self.parameters.insert(task, parameters);
        self
    }

    pub fn reporting_depth(mut self, depth: usize) -> Self {
        self.reported_depth = Some(depth);
        self
    }

    pub fn failing_depth(mut self) -> Self {
        self.fail_depth = true;
        self
    }

    pub fn failing_dequeue(mut self) -> Self {
        self.fail_dequeue = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.entries.lock().len()
    }
}

impl QueuePlatform for FakeQueue {
    fn find_queue(&self, name: &str) -> Result<QueueId, QueueError> {
        match name {
            "slurm" => Ok(QueueId("queue-slurm".to_string())),
            other => Err(QueueError::QueueNotFound(other.to_string())),
        }
    }

    fn pending_entries(&self, _queue: &QueueId) -> Result<usize, QueueError> {
        *self.depth_queries.lock() += 1;

        if self.fail_depth {
            return Err(QueueError::Rejected {
                endpoint: "queues.get_num_entries",
                status: 500,
                message: "internal error".to_string(),
            });
        }

        Ok(self.reported_depth.unwrap_or_else(|| self.remaining()))
    }

    fn dequeue(&self, _queue: &QueueId) -> Result<Option<QueueEntry>, QueueError> {
        *self.dequeues.lock() += 1;

        if self.fail_dequeue {
            return Err(QueueError::Rejected {
                endpoint: "queues.get_next_task",
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        Ok(self.entries.lock().pop_front())
    }

    fn task_parameters(&self, task: &TaskId) -> Result<TaskParameters, QueueError> {
        self.parameters
            .get(task)
            .cloned()
            .ok_or_else(|| QueueError::InvalidResponse {
                endpoint: "tasks.get_by_id",
                message: format!("unknown task {task}"),
            })
    }
}

/// Scheduler whose job count can follow the submissions it receives
#[derive(Debug, Default)]
pub struct FakeScheduler {
    running: Mutex<usize>,
    count_submissions: bool,
    fail_measurement: bool,
    fail_submission_of: Vec<TaskId>,
    pub measurements: Mutex<usize>,
    pub submissions: Mutex<Vec<SubmissionPlan>>,
}

impl FakeScheduler {
    /// `running` jobs, each accepted submission adds one
    pub fn running(running: usize) -> Self {
        Self {
            running: Mutex::new(running),
            count_submissions: true,
            ..Self::default()
        }
    }

    /// `running` jobs forever, like a scheduler that lists new jobs late
    pub fn lagging(running: usize) -> Self {
        Self {
            running: Mutex::new(running),
            ..Self::default()
        }
    }

    pub fn failing_measurement(mut self) -> Self {
        self.fail_measurement = true;
        self
    }

    pub fn rejecting(mut self, task: &str) -> Self {
        self.fail_submission_of.push(TaskId(task.to_string()));
        self
    }

    pub fn submitted(&self) -> usize {
        self.submissions.lock().len()
    }
}

impl ClusterScheduler for FakeScheduler {
    fn running_jobs(&self) -> Result<usize, RemoteExecutionError> {
        *self.measurements.lock() += 1;

        if self.fail_measurement {
            return Err(RemoteExecutionError::Failed {
                status: Some(255),
                stderr: "ssh: connect to host login1 port 22: Connection refused".to_string(),
            });
        }

        Ok(*self.running.lock())
    }

    fn submit(&self, plan: &SubmissionPlan) -> Result<Option<SlurmJobId>, RemoteExecutionError> {
        if self.fail_submission_of.contains(&plan.task_id) {
            return Err(RemoteExecutionError::Failed {
                status: Some(1),
                stderr: "sbatch: error: Batch job submission failed".to_string(),
            });
        }

        let mut submissions = self.submissions.lock();
        submissions.push(plan.clone());

        if self.count_submissions {
            *self.running.lock() += 1;
        }

        Ok(Some(SlurmJobId(1000 + submissions.len() as u64)))
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}
