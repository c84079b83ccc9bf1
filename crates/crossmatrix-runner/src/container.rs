//! Docker execution backend.

use crate::archive;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use crossmatrix_core::error::Operation;
use crossmatrix_core::ports::{
    ContainerHandle, ExecCommand, ExecOutput, ExecutionBackend, ImageRef, ImageSpec,
    ResourceHandle, ResourceKind, RunSpec,
};
use crossmatrix_core::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Settings for the Docker backend.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Retries for container creation, which fails transiently under load.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub pull: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            retry_delay_ms: 1000,
            pull: false,
        }
    }
}

/// A container created but not yet returned to the caller.
///
/// Dropped while armed (the run future was cancelled between create and
/// start) it schedules a forced removal, since nothing else knows its id.
struct PendingContainer {
    docker: Docker,
    id: Option<String>,
}

impl PendingContainer {
    fn new(docker: Docker, id: String) -> Self {
        Self { docker, id: Some(id) }
    }

    fn disarm(&mut self) {
        self.id = None;
    }

    async fn remove(mut self) -> std::result::Result<(), bollard::errors::Error> {
        let Some(id) = self.id.clone() else {
            return Ok(());
        };
        let result = remove_forced(&self.docker, &id).await;
        self.id = None;
        result
    }
}

impl Drop for PendingContainer {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let docker = self.docker.clone();
                rt.spawn(async move {
                    match remove_forced(&docker, &id).await {
                        Ok(()) => debug!(container = %id, "Removed abandoned container"),
                        Err(e) => error!(container = %id, error = %e, "Failed to remove abandoned container"),
                    }
                });
            }
            Err(_) => warn!(container = %id, "Abandoned container dropped outside a runtime"),
        }
    }
}

async fn remove_forced(docker: &Docker, id: &str) -> std::result::Result<(), bollard::errors::Error> {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}

pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
}

impl DockerBackend {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect(config: DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            Error::backend(Operation::Prepare, format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self { docker, config })
    }

    pub fn with_docker(docker: Docker, config: DockerConfig) -> Self {
        Self { docker, config }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    async fn build_inner(&self, spec: &ImageSpec) -> Result<ImageRef> {
        let context = spec.context_dir.clone();
        let tar_bytes = tokio::task::spawn_blocking(move || archive::pack_dir(&context))
            .await
            .map_err(|e| Error::backend(Operation::Build, format!("Context task failed: {}", e)))??;

        let buildargs: HashMap<String, String> = spec
            .build_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            platform: spec.docker_platform.clone(),
            buildargs,
            pull: self.config.pull,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(tag = %spec.tag, platform = %spec.docker_platform, "Building image");

        let mut stream = self
            .docker
            .build_image(options, None, Some(tar_bytes.into()));

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| Error::backend(Operation::Build, e.to_string()))?;
            if let Some(err) = info.error {
                return Err(Error::backend(Operation::Build, err));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %spec.tag, "{}", line);
                }
            }
        }

        Ok(ImageRef {
            id: spec.tag.clone(),
            owner: spec.owner.clone(),
        })
    }

    async fn create_and_start(&self, image: &ImageRef, spec: &RunSpec) -> Result<ContainerHandle> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let container_config = Config {
            image: Some(image.id.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some("/build".to_string()),
            host_config: Some(bollard::models::HostConfig {
                network_mode: spec.network.clone(),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: Some(spec.docker_platform.clone()),
        };

        let created = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::backend(Operation::Run, format!("Failed to create container: {}", e)))?;

        let mut pending = PendingContainer::new(self.docker.clone(), created.id.clone());
        let handle = ContainerHandle {
            id: created.id,
            owner: spec.owner.clone(),
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Not yet registered with the lifecycle, so remove it here.
            if let Err(removal) = pending.remove().await {
                error!(container = %handle.id, error = %removal, "Failed to remove container after start failure");
                return Err(Error::ResourceLeak {
                    resource: format!("container {}", handle.id),
                    attempts: 1,
                    message: format!("start failed: {}; removal failed: {}", e, removal),
                });
            }
            return Err(Error::backend(
                Operation::Run,
                format!("Failed to start container: {}", e),
            ));
        }

        pending.disarm();
        Ok(handle)
    }

    async fn exec_inner(&self, container: &ContainerHandle, command: &ExecCommand) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                &container.id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.argv()),
                    working_dir: command.workdir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::backend(Operation::Exec, e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::backend(Operation::Exec, e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %container.id, error = %e, "Error reading exec output");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::backend(Operation::Exec, e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn destroy_inner(&self, handle: &ResourceHandle) -> std::result::Result<(), bollard::errors::Error> {
        match handle.kind {
            ResourceKind::Container => {
                self.docker
                    .remove_container(
                        &handle.id,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await
            }
            ResourceKind::Image => self
                .docker
                .remove_image(
                    &handle.id,
                    Some(RemoveImageOptions {
                        force: true,
                        ..Default::default()
                    }),
                    None,
                )
                .await
                .map(|_| ()),
            ResourceKind::Network => self.docker.remove_network(&handle.id).await,
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn build(&self, spec: &ImageSpec, limit: Duration) -> Result<ImageRef> {
        match timeout(limit, self.build_inner(spec)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tag = %spec.tag, "Image build timed out");
                Err(Error::timeout(Operation::Build, limit))
            }
        }
    }

    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> Result<ContainerHandle> {
        let mut last_error = None;
        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                info!(attempt, container = %spec.name, "Retrying container start");
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }

            match self.create_and_start(image, spec).await {
                Ok(handle) => {
                    debug!(container = %handle.id, name = %spec.name, "Container running");
                    return Ok(handle);
                }
                Err(e @ Error::ResourceLeak { .. }) => return Err(e),
                Err(e) => {
                    warn!(error = %e, attempt, "Container start failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::backend(Operation::Run, "container start failed")))
    }

    async fn exec(
        &self,
        container: &ContainerHandle,
        command: &ExecCommand,
        limit: Duration,
    ) -> Result<ExecOutput> {
        match timeout(limit, self.exec_inner(container, command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(Operation::Exec, limit)),
        }
    }

    async fn copy_out(
        &self,
        container: &ContainerHandle,
        source: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut stream = self.docker.download_from_container(
            &container.id,
            Some(DownloadFromContainerOptions {
                path: source.to_string(),
            }),
        );

        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::backend(Operation::CopyOut, format!("{}: {}", source, e))
            })?;
            bytes.extend_from_slice(&chunk);
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || archive::unpack_files(bytes.as_slice(), &dest))
            .await
            .map_err(|e| Error::backend(Operation::CopyOut, format!("Unpack task failed: {}", e)))?
    }

    async fn destroy(&self, handle: &ResourceHandle, limit: Duration) -> Result<()> {
        match timeout(limit, self.destroy_inner(handle)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_not_found(&e) => {
                debug!(resource = %handle, "Resource already gone");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::backend(Operation::Destroy, format!("{}: {}", handle, e))),
            Err(_) => Err(Error::timeout(Operation::Destroy, limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".into(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }

    #[test]
    fn test_default_config() {
        let config = DockerConfig::default();
        assert_eq!(config.retry_count, 2);
        assert!(!config.pull);
    }
}
