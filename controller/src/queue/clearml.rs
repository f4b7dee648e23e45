use super::{QueueEntry, QueueError, QueueId, QueuePlatform, TaskId, TaskParameters};
use crate::container::DatasetRegistry;
use parking_lot::Mutex;
use reqwest::{
    blocking::{Client, Response},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info, instrument};

/// Blocking client for the subset of the ClearML REST API the controller uses
#[derive(Debug)]
pub struct ClearmlClient {
    http: Client,
    api_host: String,
    access_key: String,
    secret_key: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    meta: Meta,
}

#[derive(Deserialize, Debug)]
struct Meta {
    #[serde(default)]
    result_msg: String,
}

#[derive(Deserialize, Debug)]
struct Login {
    token: String,
}

#[derive(Deserialize, Debug)]
struct Record {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Debug)]
struct Queues {
    queues: Vec<Record>,
}

#[derive(Deserialize, Debug)]
struct NumEntries {
    num: usize,
}

#[derive(Deserialize, Debug)]
struct NextTask {
    #[serde(default)]
    entry: Option<Entry>,
}

#[derive(Deserialize, Debug)]
struct Entry {
    task: String,
    #[serde(default)]
    added: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TaskById {
    task: TaskRecord,
}

#[derive(Deserialize, Debug)]
struct TaskRecord {
    #[serde(default)]
    name: String,
    #[serde(default)]
    hyperparams: BTreeMap<String, BTreeMap<String, ParamItem>>,
}

#[derive(Deserialize, Debug)]
struct ParamItem {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Projects {
    projects: Vec<Record>,
}

#[derive(Deserialize, Debug)]
struct Tasks {
    tasks: Vec<Record>,
}

/// the server matches `name` filters as regular expressions
fn exact_name(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() + 2);
    pattern.push('^');
    for c in name.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('$');
    pattern
}

fn decode<T: DeserializeOwned>(
    endpoint: &'static str,
    status: StatusCode,
    body: &str,
) -> Result<T, QueueError> {
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|envelope| envelope.meta.result_msg)
            .unwrap_or_else(|_| body.chars().take(200).collect());

        return Err(QueueError::Rejected {
            endpoint,
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str::<Envelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|error| QueueError::InvalidResponse {
            endpoint,
            message: error.to_string(),
        })
}

/// flatten `hyperparams` sections into `section/name` keys
fn task_parameters(record: TaskRecord) -> TaskParameters {
    let mut parameters = TaskParameters::new(record.name);

    for (section, items) in record.hyperparams {
        for (name, item) in items {
            if let Some(value) = item.value {
                parameters.insert(format!("{section}/{name}"), value);
            }
        }
    }

    parameters
}

impl ClearmlClient {
    pub fn new(
        api_host: &str,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            api_host: api_host.trim_end_matches('/').to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            token: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.api_host)
    }

    fn login(&self) -> Result<String, QueueError> {
        let response = self
            .http
            .post(self.url("auth.login"))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .json(&json!({}))
            .send()?;
        let status = response.status();
        let login: Login = decode("auth.login", status, &response.text()?)?;

        debug!("Obtained ClearML session token");

        Ok(login.token)
    }

    fn token(&self) -> Result<String, QueueError> {
        let mut token = self.token.lock();

        match token.as_ref() {
            Some(token) => Ok(token.clone()),
            None => {
                let fresh = self.login()?;
                *token = Some(fresh.clone());

                Ok(fresh)
            }
        }
    }

    fn send<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<Response, QueueError> {
        let token = self.token()?;

        Ok(self
            .http
            .post(self.url(endpoint))
            .bearer_auth(token)
            .json(body)
            .send()?)
    }

    /// call `endpoint`, logging in again once if the session token expired
    fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        body: &B,
    ) -> Result<T, QueueError> {
        let mut response = self.send(endpoint, body)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(endpoint, "Session token rejected, logging in again");
            *self.token.lock() = None;
            response = self.send(endpoint, body)?;
        }

        let status = response.status();
        decode(endpoint, status, &response.text()?)
    }
}

impl QueuePlatform for ClearmlClient {
    #[instrument(level = "debug", skip(self))]
    fn find_queue(&self, name: &str) -> Result<QueueId, QueueError> {
        let queues: Queues = self.call(
            "queues.get_all",
            &json!({ "name": exact_name(name), "only_fields": ["id", "name"] }),
        )?;

        let queue = queues
            .queues
            .into_iter()
            .find(|queue| queue.name == name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;

        info!("Found queue '{name}' with ID: {}", queue.id);

        Ok(QueueId(queue.id))
    }

    fn pending_entries(&self, queue: &QueueId) -> Result<usize, QueueError> {
        let entries: NumEntries =
            self.call("queues.get_num_entries", &json!({ "queue": queue.0 }))?;

        Ok(entries.num)
    }

    fn dequeue(&self, queue: &QueueId) -> Result<Option<QueueEntry>, QueueError> {
        let next: NextTask = self.call("queues.get_next_task", &json!({ "queue": queue.0 }))?;

        Ok(next.entry.map(|entry| QueueEntry {
            task: TaskId(entry.task),
            added: entry.added,
        }))
    }

    #[instrument(level = "debug", skip(self))]
    fn task_parameters(&self, task: &TaskId) -> Result<TaskParameters, QueueError> {
        let record: TaskById = self.call("tasks.get_by_id", &json!({ "task": task.0 }))?;

        Ok(task_parameters(record.task))
    }
}

impl DatasetRegistry for ClearmlClient {
    /// latest dataset version named `name` in `project`
    #[instrument(level = "debug", skip(self))]
    fn dataset_id(&self, project: &str, name: &str) -> Result<String, QueueError> {
        let dataset_project = format!("{project}/.datasets/{name}");
        let projects: Projects = self.call(
            "projects.get_all",
            &json!({ "name": exact_name(&dataset_project), "only_fields": ["id", "name"] }),
        )?;
        let project_id = projects
            .projects
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::InvalidResponse {
                endpoint: "projects.get_all",
                message: format!("no dataset project {dataset_project}"),
            })?
            .id;

        let tasks: Tasks = self.call(
            "tasks.get_all",
            &json!({
                "project": [project_id],
                "system_tags": ["dataset"],
                "order_by": ["-last_update"],
                "only_fields": ["id"],
                "page": 0,
                "page_size": 1,
            }),
        )?;

        tasks
            .tasks
            .into_iter()
            .next()
            .map(|task| task.id)
            .ok_or_else(|| QueueError::InvalidResponse {
                endpoint: "tasks.get_all",
                message: format!("no dataset versions in {dataset_project}"),
            })
    }
}
