use crate::queue::{ParameterError, QueueError, TaskParameters};
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const SOURCE_TYPE: &str = "slurm/container_source/type";
pub const SOURCE_DOCKER_URL: &str = "slurm/container_source/docker_url";
pub const SOURCE_SIF_PATH: &str = "slurm/container_source/sif_path";
pub const SOURCE_PROJECT: &str = "slurm/container_source/project";
pub const SOURCE_TASK_NAME: &str = "slurm/container_source/task_name";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Unsupported container source type '{0}'")]
    UnsupportedContainerSource(String),
    #[error("Invalid container source: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Dataset registry lookup for {project}/{name} failed: {source}")]
    Registry {
        project: String,
        name: String,
        source: QueueError,
    },
}

impl ContainerError {
    /// configuration errors are never worth retrying, registry failures might be
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::Registry { .. })
    }
}

/// Where the execution environment of a job comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerSource {
    /// image reference singularity can pull, e.g. `docker://org/image:tag`
    Docker { url: String },
    /// `.sif` image already present on the cluster filesystem
    PrebuiltImage { path: String },
    /// dataset in the artifact registry that contains a packaged `.sif` image
    ArtifactDataset { project: String, name: String },
}

impl ContainerSource {
    pub fn from_parameters(parameters: &TaskParameters) -> Result<Self, ContainerError> {
        let source_type = parameters.get(SOURCE_TYPE).unwrap_or("none");

        match source_type {
            "docker_url" => Ok(Self::Docker {
                url: parameters.require(SOURCE_DOCKER_URL)?.to_string(),
            }),
            "sif_path" => Ok(Self::PrebuiltImage {
                path: parameters.require(SOURCE_SIF_PATH)?.to_string(),
            }),
            "artifact_task" => Ok(Self::ArtifactDataset {
                project: parameters.require(SOURCE_PROJECT)?.to_string(),
                name: parameters.require(SOURCE_TASK_NAME)?.to_string(),
            }),
            other => Err(ContainerError::UnsupportedContainerSource(other.to_string())),
        }
    }
}

impl fmt::Display for ContainerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker { url } => write!(f, "docker image {url}"),
            Self::PrebuiltImage { path } => write!(f, "image file {path}"),
            Self::ArtifactDataset { project, name } => write!(f, "dataset {project}/{name}"),
        }
    }
}

/// Concrete image a job runs in, and how the job gets hold of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedContainer {
    /// run directly from this reference (image URL or filesystem path)
    Image(String),
    /// fetch the dataset into scratch first, then run the `.sif` found inside it
    Dataset { id: String },
}

impl ResolvedContainer {
    pub fn needs_fetch(&self) -> bool {
        matches!(self, Self::Dataset { .. })
    }
}

/// Lookup of dataset ids in the artifact registry
pub trait DatasetRegistry {
    fn dataset_id(&self, project: &str, name: &str) -> Result<String, QueueError>;
}

pub struct Resolver<'a, R: DatasetRegistry + ?Sized> {
    registry: &'a R,
}

impl<'a, R: DatasetRegistry + ?Sized> Resolver<'a, R> {
    pub fn new(registry: &'a R) -> Self {
        Self { registry }
    }

    pub fn resolve(&self, source: &ContainerSource) -> Result<ResolvedContainer, ContainerError> {
        match source {
            ContainerSource::Docker { url } => Ok(ResolvedContainer::Image(url.clone())),
            ContainerSource::PrebuiltImage { path } => Ok(ResolvedContainer::Image(path.clone())),
            ContainerSource::ArtifactDataset { project, name } => {
                let id = self
                    .registry
                    .dataset_id(project, name)
                    .map_err(|source| ContainerError::Registry {
                        project: project.clone(),
                        name: name.clone(),
                        source,
                    })?;

                debug!(project = %project, name = %name, id = %id, "Resolved container dataset");

                Ok(ResolvedContainer::Dataset { id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;

    fn parameters(pairs: &[(&str, &str)]) -> TaskParameters {
        pairs
            .iter()
            .fold(TaskParameters::new("task"), |params, (key, value)| {
                params.with(*key, *value)
            })
    }

    #[test]
    fn docker_source_resolves_verbatim() {
        let registry = FakeRegistry::default();
        let source = ContainerSource::from_parameters(&parameters(&[
            (SOURCE_TYPE, "docker_url"),
            (SOURCE_DOCKER_URL, "docker://thewillyp/devenv:cpu"),
        ]))
        .unwrap();

        assert_eq!(
            Resolver::new(&registry).resolve(&source).unwrap(),
            ResolvedContainer::Image("docker://thewillyp/devenv:cpu".to_string())
        );
        assert!(registry.lookups().is_empty());
    }

    #[test]
    fn sif_source_resolves_to_path() {
        let registry = FakeRegistry::default();
        let source = ContainerSource::from_parameters(&parameters(&[
            (SOURCE_TYPE, "sif_path"),
            (SOURCE_SIF_PATH, "/scratch/images/devenv.sif"),
        ]))
        .unwrap();

        assert_eq!(
            Resolver::new(&registry).resolve(&source).unwrap(),
            ResolvedContainer::Image("/scratch/images/devenv.sif".to_string())
        );
    }

    #[test]
    fn artifact_source_looks_up_dataset() {
        let registry = FakeRegistry::default().with_dataset("shared", "singularity_devenv", "ds-42");
        let source = ContainerSource::from_parameters(&parameters(&[
            (SOURCE_TYPE, "artifact_task"),
            (SOURCE_PROJECT, "shared"),
            (SOURCE_TASK_NAME, "singularity_devenv"),
        ]))
        .unwrap();

        let resolved = Resolver::new(&registry).resolve(&source).unwrap();

        assert_eq!(resolved, ResolvedContainer::Dataset { id: "ds-42".to_string() });
        assert!(resolved.needs_fetch());
        assert_eq!(
            registry.lookups(),
            vec![("shared".to_string(), "singularity_devenv".to_string())]
        );
    }

    #[test]
    fn unknown_or_missing_type_is_unsupported() {
        for params in [parameters(&[(SOURCE_TYPE, "oci_bundle")]), parameters(&[])] {
            match ContainerSource::from_parameters(&params) {
                Err(error @ ContainerError::UnsupportedContainerSource(_)) => {
                    assert!(error.is_configuration())
                }
                other => panic!("expected unsupported source, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_payload_names_the_key() {
        let error = ContainerSource::from_parameters(&parameters(&[(SOURCE_TYPE, "docker_url")]))
            .unwrap_err();

        assert!(matches!(
            error,
            ContainerError::Parameter(ParameterError::Missing(ref key)) if key == SOURCE_DOCKER_URL
        ));
    }

    #[test]
    fn registry_failures_are_not_configuration_errors() {
        let registry = FakeRegistry::default();
        let source = ContainerSource::ArtifactDataset {
            project: "shared".to_string(),
            name: "missing".to_string(),
        };

        let error = Resolver::new(&registry).resolve(&source).unwrap_err();

        assert!(!error.is_configuration());
    }
}
