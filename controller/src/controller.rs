use crate::{
    container::{ContainerError, ContainerSource, DatasetRegistry, Resolver},
    queue::{ParameterError, QueueEntry, QueueError, QueueId, QueuePlatform, TaskId},
    remote::{
        slurm::{ClusterScheduler, SlurmJobId},
        RemoteExecutionError,
    },
    script::{JobIdentity, ResourceSpec, ScriptBuilder, SubmissionPlan},
    secrets::SecretsSnapshot,
};
use std::{fmt, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Where the controller blocks between iterations
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Remote(#[from] RemoteExecutionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// the entry itself cannot be turned into a job
    ConfigurationError,
    /// the head-node or the scheduler failed, later entries may still succeed
    TransientRemoteError,
    /// the queue platform failed for this entry, only a failed dequeue ends the burst
    QueuePlatformError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::TransientRemoteError => "TransientRemoteError",
            ErrorKind::QueuePlatformError => "QueuePlatformError",
        };

        f.write_str(name)
    }
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::Parameter(_) => ErrorKind::ConfigurationError,
            SubmissionError::Container(error) if error.is_configuration() => {
                ErrorKind::ConfigurationError
            }
            SubmissionError::Container(_) | SubmissionError::Queue(_) => {
                ErrorKind::QueuePlatformError
            }
            SubmissionError::Remote(_) => ErrorKind::TransientRemoteError,
        }
    }
}

/// Job count of the cluster user against the admission ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionState {
    pub running_jobs: usize,
    pub ceiling: usize,
}

impl AdmissionState {
    pub fn headroom(&self) -> usize {
        self.ceiling.saturating_sub(self.running_jobs)
    }

    pub fn is_saturated(&self) -> bool {
        self.running_jobs >= self.ceiling
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// polling at the lazy interval
    Idle,
    /// dequeuing and submitting until a bound or an early exit is hit
    Draining { depth: usize, headroom: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstStop {
    /// as many entries were dequeued as the queue held at burst start
    DepthExhausted,
    /// the ceiling was reached, or the headroom seen at burst start is used up
    CeilingReached,
    /// the platform handed out nothing, another consumer may have won
    QueueEmpty,
    /// the job count could not be re-measured
    MeasurementFailed,
    /// dequeuing failed mid-burst
    QueueError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// ceiling reached, the queue was not touched
    Saturated(AdmissionState),
    /// capacity available but nothing queued
    Idle(AdmissionState),
    Drained {
        depth: usize,
        processed: usize,
        stop: BurstStop,
    },
    /// the job count or the queue depth could not be read
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub submitted: usize,
    pub failed: usize,
}

/// Counters for one burst
#[derive(Debug, Clone, Copy, Default)]
struct Burst {
    dequeued: usize,
    submitted: usize,
    failed: usize,
}

/// The external systems the controller drives
pub struct Collaborators<'a> {
    pub queue: &'a dyn QueuePlatform,
    pub registry: &'a dyn DatasetRegistry,
    pub scheduler: &'a dyn ClusterScheduler,
    pub sleeper: &'a dyn Sleeper,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionSettings {
    pub ceiling: usize,
    pub poll_interval: Duration,
}

/// Drains a queue into the batch scheduler without exceeding the job ceiling
pub struct Controller<'a> {
    queue: &'a dyn QueuePlatform,
    registry: &'a dyn DatasetRegistry,
    scheduler: &'a dyn ClusterScheduler,
    sleeper: &'a dyn Sleeper,
    queue_id: QueueId,
    settings: AdmissionSettings,
    builder: ScriptBuilder,
    secrets: SecretsSnapshot,
    state: ControllerState,
    totals: Totals,
}

impl<'a> Controller<'a> {
    /// look up `queue_name` once; a missing queue is fatal
    pub fn new(
        collaborators: Collaborators<'a>,
        queue_name: &str,
        settings: AdmissionSettings,
        builder: ScriptBuilder,
        secrets: SecretsSnapshot,
    ) -> Result<Self, QueueError> {
        let queue_id = collaborators.queue.find_queue(queue_name)?;

        Ok(Self {
            queue: collaborators.queue,
            registry: collaborators.registry,
            scheduler: collaborators.scheduler,
            sleeper: collaborators.sleeper,
            queue_id,
            settings,
            builder,
            secrets,
            state: ControllerState::Idle,
            totals: Totals::default(),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn run(&mut self) -> ! {
        info!(
            queue = %self.queue_id,
            ceiling = self.settings.ceiling,
            "Starting SLURM controller"
        );

        loop {
            self.step();
        }
    }

    pub fn run_for(&mut self, iterations: usize) -> Totals {
        for _ in 0..iterations {
            self.step();
        }

        self.totals
    }

    /// one poll of the scheduler and the queue, followed by one sleep
    #[instrument(level = "debug", skip(self))]
    pub fn step(&mut self) -> IterationOutcome {
        let outcome = self.poll();
        self.sleeper.sleep(self.settings.poll_interval);
        outcome
    }

    fn measure(&self) -> Result<AdmissionState, RemoteExecutionError> {
        Ok(AdmissionState {
            running_jobs: self.scheduler.running_jobs()?,
            ceiling: self.settings.ceiling,
        })
    }

    fn poll(&mut self) -> IterationOutcome {
        let admission = match self.measure() {
            Ok(admission) => admission,
            Err(error) => {
                error!(error = ?error, "Failed to count jobs on the cluster");
                return IterationOutcome::Failed;
            }
        };

        if admission.is_saturated() {
            info!(
                running = admission.running_jobs,
                "Max jobs ({}) reached, sleeping...", admission.ceiling
            );
            return IterationOutcome::Saturated(admission);
        }

        let depth = match self.queue.pending_entries(&self.queue_id) {
            Ok(depth) => depth,
            Err(error) => {
                error!(error = ?error, queue = %self.queue_id, "Failed to read queue depth");
                return IterationOutcome::Failed;
            }
        };

        if depth == 0 {
            info!("No tasks in queue, lazy polling...");
            return IterationOutcome::Idle(admission);
        }

        info!(
            running = admission.running_jobs,
            "Found {depth} tasks in queue, fast polling..."
        );

        self.state = ControllerState::Draining {
            depth,
            headroom: admission.headroom(),
        };
        let (burst, stop) = self.drain(depth, admission.headroom());
        self.state = ControllerState::Idle;

        self.totals.submitted += burst.submitted;
        self.totals.failed += burst.failed;

        info!(
            submitted = burst.submitted,
            failed = burst.failed,
            stop = ?stop,
            total_submitted = self.totals.submitted,
            total_failed = self.totals.failed,
            "Burst finished, processed {}/{depth}", burst.dequeued
        );

        IterationOutcome::Drained {
            depth,
            processed: burst.dequeued,
            stop,
        }
    }

    fn drain(&self, depth: usize, headroom: usize) -> (Burst, BurstStop) {
        let mut burst = Burst::default();

        let stop = loop {
            if burst.dequeued >= depth {
                break BurstStop::DepthExhausted;
            }

            if burst.submitted >= headroom {
                info!(
                    "Submitted {} jobs, the headroom seen at burst start is used up",
                    burst.submitted
                );
                break BurstStop::CeilingReached;
            }

            match self.measure() {
                Ok(admission) if admission.is_saturated() => {
                    info!(
                        "Hit max jobs limit during burst, processed {}/{depth}",
                        burst.dequeued
                    );
                    break BurstStop::CeilingReached;
                }
                Ok(_) => {}
                Err(error) => {
                    error!(error = ?error, "Failed to count jobs on the cluster during burst");
                    break BurstStop::MeasurementFailed;
                }
            }

            let entry = match self.queue.dequeue(&self.queue_id) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    info!("No more tasks available, processed {}/{depth}", burst.dequeued);
                    break BurstStop::QueueEmpty;
                }
                Err(error) => {
                    error!(error = ?error, queue = %self.queue_id, "Failed to dequeue");
                    break BurstStop::QueueError;
                }
            };
            burst.dequeued += 1;

            match self.submit_entry(&entry) {
                Ok(job) => {
                    burst.submitted += 1;
                    match job {
                        Some(job) => info!(task = %entry.task, job = %job, "Submitted SLURM job"),
                        None => warn!(task = %entry.task, "Submitted SLURM job without a job id"),
                    }
                }
                Err(error) => {
                    burst.failed += 1;
                    let kind = error.kind();
                    error!(
                        task = %entry.task,
                        kind = %kind,
                        error = ?error,
                        "Failed to submit task, the entry is dropped"
                    );
                }
            }
        };

        (burst, stop)
    }

    /// render the batch script for `task` without touching the queue or the scheduler
    pub fn plan(&self, task: &TaskId) -> Result<SubmissionPlan, SubmissionError> {
        let parameters = self.queue.task_parameters(task)?;
        let source = ContainerSource::from_parameters(&parameters)?;
        let resources = ResourceSpec::from_parameters(&parameters)?;
        let container = Resolver::new(self.registry).resolve(&source)?;
        debug!(
            task = %task,
            parameters = parameters.len(),
            source = %source,
            fetch = container.needs_fetch(),
            "Resolved container"
        );

        let identity = JobIdentity {
            task_id: task.clone(),
            task_name: parameters.name,
        };

        Ok(self
            .builder
            .build(&resources, &container, &identity, &self.secrets))
    }

    #[instrument(level = "debug", skip(self, entry), fields(task = %entry.task))]
    pub fn submit_entry(&self, entry: &QueueEntry) -> Result<Option<SlurmJobId>, SubmissionError> {
        let plan = self.plan(&entry.task)?;
        info!("Submitting SLURM job for task {}", entry.task);

        Ok(self.scheduler.submit(&plan)?)
    }
}
