use crate::{
    queue::{ParameterError, QueueError, QueuePlatform, TaskId, TaskParameters},
    remote::{CURRENT_USER, LOCAL_HOSTNAME},
    script::DEFAULT_AGENT_IMAGE,
    secrets::SecretsSnapshot,
};
use http::Uri;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Error, path::Path, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

/// keys of the controller's own task that override the config file
pub const QUEUE_NAME: &str = "slurm/queue_name";
pub const MAX_JOBS: &str = "slurm/max_jobs";
pub const LAZY_POLL_INTERVAL: &str = "slurm/lazy_poll_interval";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to open config file: {0}")]
    Open(#[from] Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid controller task parameter: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Failed to read the controller task: {0}")]
    ControllerTask(#[from] QueueError),
    #[error("Config failed preflight checks")]
    Preflight,
    #[error("Cluster head-node is not configured and the local hostname is unknown")]
    MissingHost,
    #[error("Cluster user is not configured and the current user is unknown")]
    MissingUser,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    // name of the queue platform queue that is drained
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    // ceiling for jobs of the cluster user, queued and running alike
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    // seconds between polls while idle or saturated, fractions are allowed
    #[serde(default = "default_poll_interval")]
    pub lazy_poll_interval: f64,
    #[serde(default)]
    pub clearml: ClearmlConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    // image that runs `clearml-data` for containers shipped as datasets
    #[serde(default = "default_agent_image")]
    pub agent_image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClearmlConfig {
    // falls back to CLEARML_API_HOST from the secrets
    #[serde(default, with = "optional_uri")]
    pub api_host: Option<Uri>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // ssh target for squeue/sbatch, defaults to the local hostname
    pub host: Option<String>,
    // user whose jobs are counted, defaults to the user running the controller
    pub user: Option<String>,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: f64,
}

impl Default for ClearmlConfig {
    fn default() -> Self {
        Self {
            api_host: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            ssh_timeout: default_ssh_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            max_jobs: default_max_jobs(),
            lazy_poll_interval: default_poll_interval(),
            clearml: ClearmlConfig::default(),
            cluster: ClusterConfig::default(),
            agent_image: default_agent_image(),
        }
    }
}

/// `http_serde::uri` for an optional field
mod optional_uri {
    use http::Uri;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "http_serde::uri")] Uri);

    pub fn serialize<S: Serializer>(value: &Option<Uri>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(uri) => http_serde::uri::serialize(uri, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Uri>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(uri)| uri))
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl ControllerConfig {
    /// read the config from `path`, or use the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => Ok(serde_yaml::from_reader(File::open(path)?)?),
            None => Ok(Self::default()),
        }
    }

    /// read the controller's own task from the queue platform and apply its parameters
    pub fn apply_controller_task(&mut self, queue: &dyn QueuePlatform, task: &TaskId) -> Result<(), ConfigErrors> {
        let parameters = queue.task_parameters(task)?;
        self.apply_task_parameters(&parameters)
    }

    /// override queue name, ceiling and poll interval with the values set on
    /// the controller's own task; keys that are unset keep the file's values
    pub fn apply_task_parameters(&mut self, parameters: &TaskParameters) -> Result<(), ConfigErrors> {
        if let Some(queue_name) = parameters.get(QUEUE_NAME) {
            self.queue_name = queue_name.trim().to_string();
        }
        self.max_jobs = parameters.parse_or(MAX_JOBS, self.max_jobs)?;
        self.lazy_poll_interval = parameters.parse_or(LAZY_POLL_INTERVAL, self.lazy_poll_interval)?;

        info!(
            queue = %self.queue_name,
            max_jobs = self.max_jobs,
            lazy_poll_interval = self.lazy_poll_interval,
            task = %parameters.name,
            "Applied controller task parameters"
        );

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        seconds(self.lazy_poll_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.clearml.request_timeout)
    }

    pub fn ssh_timeout(&self) -> Duration {
        seconds(self.cluster.ssh_timeout)
    }

    pub fn head_node(&self) -> Result<String, ConfigErrors> {
        self.cluster
            .host
            .clone()
            .or_else(|| LOCAL_HOSTNAME.clone())
            .ok_or(ConfigErrors::MissingHost)
    }

    pub fn cluster_user(&self) -> Result<String, ConfigErrors> {
        self.cluster
            .user
            .clone()
            .or_else(|| CURRENT_USER.clone())
            .ok_or(ConfigErrors::MissingUser)
    }

    pub fn api_host(&self, secrets: &SecretsSnapshot) -> String {
        match &self.clearml.api_host {
            Some(uri) => uri.to_string().trim_end_matches('/').to_string(),
            None => secrets.clearml_api_host.trim_end_matches('/').to_string(),
        }
    }

    /// log every problem with the config, returns true if any was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.queue_name.trim().is_empty() {
            error!("queue_name must not be empty");
            contains_error = true;
        }

        if self.max_jobs == 0 {
            error!("max_jobs is 0, the controller would never submit a job");
            contains_error = true;
        }

        for (name, value) in [
            ("lazy_poll_interval", self.lazy_poll_interval),
            ("clearml.request_timeout", self.clearml.request_timeout),
            ("cluster.ssh_timeout", self.cluster.ssh_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                error!("{name} must be a positive number of seconds, got {value}");
                contains_error = true;
            }
        }

        if self.lazy_poll_interval.is_finite() && self.lazy_poll_interval < 1.0 {
            warn!(
                "lazy_poll_interval of {}s polls the queue platform and the scheduler very often",
                self.lazy_poll_interval
            );
        }

        if let Some(uri) = &self.clearml.api_host {
            if uri.scheme().is_none() || uri.host().is_none() {
                error!("clearml.api_host ({uri}) must be an absolute URL, e.g. https://api.clear.ml");
                contains_error = true;
            }
        }

        if self.agent_image.trim().is_empty() {
            error!("agent_image must not be empty");
            contains_error = true;
        }

        contains_error
    }
}

fn default_queue_name() -> String {
    "slurm".to_string()
}

fn default_max_jobs() -> usize {
    1950
}

fn default_poll_interval() -> f64 {
    5.0
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_ssh_timeout() -> f64 {
    60.0
}

fn default_agent_image() -> String {
    DEFAULT_AGENT_IMAGE.to_string()
}
