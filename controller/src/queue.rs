pub mod clearml;

use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),
    #[error("Request to the queue platform failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Queue platform rejected {endpoint} with status {status}: {message}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        message: String,
    },
    #[error("Unexpected response from {endpoint}: {message}")]
    InvalidResponse {
        endpoint: &'static str,
        message: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Task parameter {0} is not set")]
    Missing(String),
    #[error("Task parameter {key} has an invalid value '{value}'")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueId(pub String);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One dequeued unit of work, handed out exactly once by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task: TaskId,
    /// enqueue timestamp as reported by the platform
    pub added: Option<String>,
}

/// Declared parameters of a queued task, keyed as `section/name`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskParameters {
    pub name: String,
    values: BTreeMap<String, String>,
}

impl TaskParameters {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// returns the value for `key`, treating empty strings as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, ParameterError> {
        self.get(key)
            .ok_or_else(|| ParameterError::Missing(key.to_string()))
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T, ParameterError> {
        let value = self.require(key)?;

        value.trim().parse().map_err(|_| ParameterError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ParameterError> {
        match self.get(key) {
            Some(_) => self.parse(key),
            None => Ok(default),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Operations the controller needs from the queue platform
pub trait QueuePlatform {
    fn find_queue(&self, name: &str) -> Result<QueueId, QueueError>;

    fn pending_entries(&self, queue: &QueueId) -> Result<usize, QueueError>;

    /// non-blocking, `None` when the queue is empty or another consumer won the race
    fn dequeue(&self, queue: &QueueId) -> Result<Option<QueueEntry>, QueueError>;

    fn task_parameters(&self, task: &TaskId) -> Result<TaskParameters, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_count_as_unset() {
        let params = TaskParameters::new("train").with("slurm/singularity_overlay", "  ");

        assert_eq!(params.get("slurm/singularity_overlay"), None);
        assert_eq!(
            params.require("slurm/singularity_overlay"),
            Err(ParameterError::Missing(
                "slurm/singularity_overlay".to_string()
            ))
        );
    }

    #[test]
    fn parse_reports_the_offending_key() {
        let params = TaskParameters::new("train").with("slurm/cpu", "four");

        assert_eq!(
            params.parse::<u32>("slurm/cpu"),
            Err(ParameterError::Invalid {
                key: "slurm/cpu".to_string(),
                value: "four".to_string()
            })
        );
    }

    #[test]
    fn parse_or_falls_back_only_when_unset() {
        let params = TaskParameters::new("train").with("slurm/gpu", "2");

        assert_eq!(params.parse_or("slurm/gpu", 0u32), Ok(2));
        assert_eq!(params.parse_or("slurm/missing", 0u32), Ok(0));
    }
}
