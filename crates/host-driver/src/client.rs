//! Docker Engine client bound to a forwarded socket

use crate::docker_trait::DockerApi;
use crate::error::HostError;
use crate::models::{ContainerInfo, ContainerSpec, DockerInfo, ExecOutput, RegistryAuth, RestartPolicy};
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicyNameEnum};
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Seconds before a Docker API request times out
pub const DOCKER_REQUEST_TIMEOUT_SECS: u64 = 120;

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 404, .. })
}

/// Docker client for one host
#[derive(Debug, Clone)]
pub struct DockerClient {
    host: String,
    docker: Docker,
}

impl DockerClient {
    /// Connect to a Docker socket (normally the local end of an `SshTunnel`)
    ///
    /// # Errors
    ///
    /// Returns `HostError::DockerUnavailable` if the client cannot be built.
    pub fn connect(host: &str, socket: &Path) -> Result<Self, HostError> {
        let path = socket.to_string_lossy();
        let docker = Docker::connect_with_unix(&path, DOCKER_REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| HostError::DockerUnavailable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            host: host.to_string(),
            docker,
        })
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let restart_name = match spec.restart_policy {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        };
        let non_empty = |v: &Vec<String>| if v.is_empty() { None } else { Some(v.clone()) };
        let non_blank = |s: &String| if s.is_empty() { None } else { Some(s.clone()) };

        Config {
            image: Some(spec.image.clone()),
            cmd: non_empty(&spec.cmd),
            entrypoint: non_empty(&spec.entrypoint),
            env: non_empty(&spec.env),
            labels: Some(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            host_config: Some(HostConfig {
                binds: non_empty(&spec.binds),
                cap_add: non_empty(&spec.cap_add),
                network_mode: non_blank(&spec.network_mode),
                pid_mode: non_blank(&spec.pid_mode),
                privileged: Some(spec.privileged),
                volumes_from: non_empty(&spec.volumes_from),
                restart_policy: Some(bollard::models::RestartPolicy {
                    name: Some(restart_name),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl DockerApi for DockerClient {
    async fn info(&self) -> Result<DockerInfo, HostError> {
        let info = self.docker.info().await.map_err(|e| HostError::DockerUnavailable {
            host: self.host.clone(),
            reason: e.to_string(),
        })?;
        Ok(DockerInfo {
            server_version: info.server_version.unwrap_or_default(),
            kernel_version: info.kernel_version.unwrap_or_default(),
            operating_system: info.operating_system.unwrap_or_default(),
        })
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, HostError> {
        let inspected = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(c) => c,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let config = inspected.config.unwrap_or_default();
        let state = inspected.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        Ok(Some(ContainerInfo {
            id: inspected.id.unwrap_or_default(),
            name: inspected.name.unwrap_or_default().trim_start_matches('/').to_string(),
            image: config.image.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            binds: inspected.host_config.and_then(|h| h.binds).unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
            running,
            exit_code: if running { None } else { state.exit_code },
        }))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, HostError> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries
            .into_iter()
            .map(|s| ContainerInfo {
                id: s.id.unwrap_or_default(),
                name: s
                    .names
                    .and_then(|n| n.into_iter().next())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: s.image.unwrap_or_default(),
                labels: s.labels.unwrap_or_default().into_iter().collect(),
                running: s.state.as_deref() == Some("running"),
                ..Default::default()
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, HostError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<(), HostError> {
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: Some(a.server_address.clone()),
            ..Default::default()
        });
        debug!("[{}] pulling image {}", self.host, image);
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                credentials,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| HostError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, HostError> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                Self::container_config(spec),
            )
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), HostError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), HostError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) if is_not_found(&e) => Err(HostError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), HostError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_container(&self, name: &str) -> Result<i64, HostError> {
        let mut stream = self.docker.wait_container(name, None::<WaitContainerOptions<String>>);
        let mut code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => code = response.status_code,
                // bollard reports non-zero exits as an error carrying the code
                Err(BollardError::DockerContainerWaitError { code: c, .. }) => code = c,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(code)
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, HostError> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&created.id, None).await? {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    other => stdout.push_str(&other.to_string()),
                }
            }
        }

        let inspected = self.docker.inspect_exec(&created.id).await?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn logs<'a>(&'a self, name: &'a str, tail: Option<usize>) -> BoxStream<'a, Result<String, HostError>> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        self.docker
            .logs(
                name,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail,
                    ..Default::default()
                }),
            )
            .map(|item| item.map(|line| line.to_string()).map_err(HostError::from))
            .boxed()
    }
}
