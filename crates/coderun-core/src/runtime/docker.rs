// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    UploadToContainerOptions as BollardUploadToContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::default::Default;

use super::{EnvironmentSpec, ExitStatus, LogFrame, LogStream, RuntimeClient};
use crate::errors::RuntimeClientError;

/// [`RuntimeClient`] backed by a Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect_with_local_defaults() -> Result<Self, RuntimeClientError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), RuntimeClientError> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<String, RuntimeClientError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: spec.name.clone(),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            tty: Some(spec.tty),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for container {}: {}", container.id, warning);
        }
        Ok(container.id)
    }

    async fn copy_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeClientError> {
        let options = Some(BollardUploadToContainerOptionsQuery {
            path: path.to_string(),
            ..Default::default()
        });
        self.docker
            .upload_to_container(container_id, options, bollard::body_full(archive))
            .await?;
        Ok(())
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeClientError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    fn logs<'a>(&'a self, container_id: &'a str, follow: bool) -> LogStream<'a> {
        let options = Some(BollardLogsOptionsQuery {
            follow,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        });

        let frames = self.docker.logs(container_id, options).map(|item| {
            item.map(|output| match output {
                LogOutput::StdOut { message } => LogFrame::StdOut(message),
                LogOutput::StdErr { message } => LogFrame::StdErr(message),
                LogOutput::StdIn { message } => LogFrame::StdIn(message),
                LogOutput::Console { message } => LogFrame::Console(message),
            })
            .map_err(RuntimeClientError::from)
        });
        Box::pin(frames)
    }

    async fn wait(&self, container_id: &str) -> Result<ExitStatus, RuntimeClientError> {
        // Only the first status matters; the stream ends once the container stops.
        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus::new(response.status_code)),
            // Bollard reports a non-zero exit as an error; it is still an exit.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                Ok(ExitStatus::new(code))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeClientError::StreamEnded(format!(
                "wait stream for container {} closed without a status",
                container_id
            ))),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeClientError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force,
            ..Default::default()
        });

        match self.docker.remove_container(container_id, options).await {
            Ok(()) => Ok(()),
            // 404: auto-remove got there first. 409: removal already in progress.
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                log::debug!(
                    "Container {} already gone or being removed (HTTP {})",
                    container_id,
                    status_code
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
