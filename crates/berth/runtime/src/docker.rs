//! Docker engine backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use berth_types::RuntimeId;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use tracing::{debug, info, warn};

use crate::client::RuntimeClient;
use crate::error::{Result, RuntimeError};
use crate::spec::{ContainerInfo, ContainerSpec, LiveStatus, MANAGED_LABEL};

/// Runtime backed by a local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect(request_timeout: Duration, stop_timeout: Duration) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
            .with_timeout(request_timeout);
        info!("connected to docker daemon");
        Ok(Self {
            docker,
            stop_timeout_secs: stop_timeout.as_secs() as i64,
        })
    }

    fn map_error(id: &str, err: BollardError) -> RuntimeError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(id.to_string()),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } if (400..500).contains(&status_code) => RuntimeError::Rejected(message),
            BollardError::RequestTimeoutError => RuntimeError::Timeout(Duration::ZERO),
            other => RuntimeError::Unavailable(other.to_string()),
        }
    }

    fn is_not_modified(err: &BollardError) -> bool {
        matches!(
            err,
            BollardError::DockerResponseServerError {
                status_code: 304,
                ..
            }
        )
    }

    fn live_status(status: Option<ContainerStateStatusEnum>) -> LiveStatus {
        match status {
            Some(ContainerStateStatusEnum::RUNNING) => LiveStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => LiveStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => LiveStatus::Restarting,
            Some(ContainerStateStatusEnum::EXITED) => LiveStatus::Exited,
            Some(ContainerStateStatusEnum::DEAD) | Some(ContainerStateStatusEnum::REMOVING) => {
                LiveStatus::Dead
            }
            _ => LiveStatus::Created,
        }
    }

    fn live_status_from_str(state: Option<&str>) -> LiveStatus {
        match state {
            Some("running") => LiveStatus::Running,
            Some("paused") => LiveStatus::Paused,
            Some("restarting") => LiveStatus::Restarting,
            Some("exited") => LiveStatus::Exited,
            Some("dead") | Some("removing") => LiveStatus::Dead,
            _ => LiveStatus::Created,
        }
    }
}

/// Memory limit as Docker's signed byte count.
fn memory_bytes(spec: &ContainerSpec) -> Result<i64> {
    i64::try_from(spec.memory_limit.bytes()).map_err(|_| {
        RuntimeError::Rejected(format!(
            "memory limit {} exceeds what the runtime accepts",
            spec.memory_limit
        ))
    })
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId> {
        let memory = memory_bytes(spec)?;
        let container_port = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory: Some(memory),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::map_error(&spec.name, e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let err = Self::map_error(&created.id, e);
            // A created-but-unstarted container would keep the name taken.
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self
                .docker
                .remove_container(&created.id, Some(options))
                .await
            {
                warn!(
                    name = %spec.name,
                    error = %remove_err,
                    "could not remove container that failed to start"
                );
            }
            return Err(err);
        }

        debug!(name = %spec.name, runtime_id = %created.id, "docker container started");
        Ok(RuntimeId::new(created.id))
    }

    async fn inspect(&self, id: &RuntimeId) -> Result<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_error(id.as_str(), e))?;

        let status = Self::live_status(response.state.and_then(|s| s.status));
        let name = response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        Ok(ContainerInfo {
            runtime_id: id.clone(),
            name,
            status,
        })
    }

    async fn start(&self, id: &RuntimeId) -> Result<()> {
        match self
            .docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_modified(&e) => Ok(()),
            Err(e) => Err(Self::map_error(id.as_str(), e)),
        }
    }

    async fn stop(&self, id: &RuntimeId) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_modified(&e) => Ok(()),
            Err(e) => Err(Self::map_error(id.as_str(), e)),
        }
    }

    async fn remove(&self, id: &RuntimeId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| Self::map_error(id.as_str(), e))
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Self::map_error("list", e))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(name_prefix))?;
                Some(ContainerInfo {
                    runtime_id: RuntimeId::new(id),
                    name,
                    status: Self::live_status_from_str(summary.state.as_deref()),
                })
            })
            .collect())
    }
}
