use serde::Deserialize;
use std::{collections::BTreeMap, env, fmt, fs::File, path::Path};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Failed to open secrets file: {0}")]
    Open(#[from] std::io::Error),
    #[error("Failed to parse secrets file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Required secrets are missing: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const CLEARML_API_HOST: &str = "CLEARML_API_HOST";
pub const CLEARML_WEB_HOST: &str = "CLEARML_WEB_HOST";
pub const CLEARML_FILES_HOST: &str = "CLEARML_FILES_HOST";
pub const CLEARML_API_ACCESS_KEY: &str = "CLEARML_API_ACCESS_KEY";
pub const CLEARML_API_SECRET_KEY: &str = "CLEARML_API_SECRET_KEY";

/// Every name resolved at startup, in the order they are exported into job scripts
pub const SECRET_NAMES: [&str; 8] = [
    AWS_ACCESS_KEY_ID,
    AWS_SECRET_ACCESS_KEY,
    AWS_DEFAULT_REGION,
    CLEARML_API_HOST,
    CLEARML_WEB_HOST,
    CLEARML_FILES_HOST,
    CLEARML_API_ACCESS_KEY,
    CLEARML_API_SECRET_KEY,
];

/// Point-in-time copy of the credentials, baked into every rendered job script.
///
/// The snapshot is taken once before the loop starts and is never refreshed, so
/// a rotation in the secret store only reaches jobs after a controller restart.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretsSnapshot {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_default_region: String,
    pub clearml_api_host: String,
    pub clearml_web_host: String,
    pub clearml_files_host: String,
    pub clearml_access_key: String,
    pub clearml_secret_key: String,
}

impl fmt::Debug for SecretsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsSnapshot")
            .field("aws_default_region", &self.aws_default_region)
            .field("clearml_api_host", &self.clearml_api_host)
            .field("clearml_web_host", &self.clearml_web_host)
            .field("clearml_files_host", &self.clearml_files_host)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(transparent)]
struct SecretsFile(BTreeMap<String, String>);

impl SecretsSnapshot {
    /// resolve all secrets from the process environment, with values from
    /// `file` taking precedence when given
    pub fn load(file: Option<&Path>) -> Result<Self, SecretsError> {
        let overlay = match file {
            Some(path) => {
                debug!(path = ?path, "Reading secrets file");
                serde_yaml::from_reader::<_, SecretsFile>(File::open(path)?)?.0
            }
            None => BTreeMap::new(),
        };

        Self::resolve(|name| {
            overlay
                .get(name)
                .cloned()
                .or_else(|| env::var(name).ok())
        })
    }

    /// build a snapshot from an arbitrary lookup, reporting every missing name at once
    pub fn resolve<F>(lookup: F) -> Result<Self, SecretsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut values = BTreeMap::new();

        for name in SECRET_NAMES {
            match lookup(name).filter(|value| !value.is_empty()) {
                Some(value) => {
                    values.insert(name, value);
                }
                None => {
                    error!("Secret {name} is neither set in the environment nor the secrets file");
                    missing.push(name);
                }
            }
        }

        if !missing.is_empty() {
            return Err(SecretsError::Missing(missing));
        }

        let mut take = |name: &str| values.remove(name).unwrap_or_default();

        Ok(Self {
            aws_access_key_id: take(AWS_ACCESS_KEY_ID),
            aws_secret_access_key: take(AWS_SECRET_ACCESS_KEY),
            aws_default_region: take(AWS_DEFAULT_REGION),
            clearml_api_host: take(CLEARML_API_HOST),
            clearml_web_host: take(CLEARML_WEB_HOST),
            clearml_files_host: take(CLEARML_FILES_HOST),
            clearml_access_key: take(CLEARML_API_ACCESS_KEY),
            clearml_secret_key: take(CLEARML_API_SECRET_KEY),
        })
    }

    /// (name, value) pairs in `SECRET_NAMES` order
    pub fn exports(&self) -> [(&'static str, &str); 8] {
        [
            (AWS_ACCESS_KEY_ID, self.aws_access_key_id.as_str()),
            (AWS_SECRET_ACCESS_KEY, self.aws_secret_access_key.as_str()),
            (AWS_DEFAULT_REGION, self.aws_default_region.as_str()),
            (CLEARML_API_HOST, self.clearml_api_host.as_str()),
            (CLEARML_WEB_HOST, self.clearml_web_host.as_str()),
            (CLEARML_FILES_HOST, self.clearml_files_host.as_str()),
            (CLEARML_API_ACCESS_KEY, self.clearml_access_key.as_str()),
            (CLEARML_API_SECRET_KEY, self.clearml_secret_key.as_str()),
        ]
    }
}
