//! Docker-backed container backend and host tunnel
//!
//! Every container state is a Docker image. Each step creates a short-lived
//! container from the current image, optionally runs it, and commits the
//! result to a new image whose id is both the live handle and the durable id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, UploadToContainerOptions,
    },
    image::{CommitContainerOptions, CreateImageOptions, PushImageOptions, TagImageOptions},
    models::{HostConfig, ImageConfig, PortBinding},
    Docker,
};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::ContainerBackend;
use super::tunnel::HostTunnel;
use crate::domain::container::{
    ContainerHandle, ContainerId, ExecOptions, ExecOutput, PortForward, ServiceHandle,
    TunnelHandle,
};
use crate::error::{Error, Result};

const STATE_REPO: &str = "environment-state";
const MANAGED_LABEL: &str = "environment-server.managed";
const SERVICE_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Connect to the Docker daemon
pub fn connect(socket_path: Option<&str>) -> Result<Docker> {
    let client = match socket_path {
        Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
        None => Docker::connect_with_local_defaults()?,
    };
    Ok(client)
}

/// Container backend on top of the Docker engine
pub struct DockerBackend {
    client: Docker,
    network: Option<String>,
    shell: String,
}

impl DockerBackend {
    pub fn new(client: Docker, network: Option<String>, shell: impl Into<String>) -> Self {
        Self {
            client,
            network,
            shell: shell.into(),
        }
    }

    /// Check if Docker daemon is accessible
    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::Backend(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    /// Pull an image if not present
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let image_name = if image.contains(':') || image.contains('@') {
            image.to_string()
        } else {
            format!("{}:latest", image)
        };

        if self.client.inspect_image(&image_name).await.is_ok() {
            debug!("Image {} already exists", image_name);
            return Ok(());
        }
        info!("Pulling image {}...", image_name);

        let options = CreateImageOptions {
            from_image: image_name.clone(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Backend(format!("Failed to pull image: {}", e)));
                }
            }
        }

        info!("Image {} pulled successfully", image_name);
        Ok(())
    }

    async fn image_config(&self, image: &ContainerHandle) -> Result<ImageConfig> {
        let inspect = self.client.inspect_image(image.as_str()).await?;
        Ok(inspect.config.unwrap_or_default())
    }

    async fn image_id(&self, reference: &str) -> Result<ContainerHandle> {
        let inspect = self.client.inspect_image(reference).await?;
        inspect
            .id
            .map(ContainerHandle::new)
            .ok_or_else(|| Error::Backend(format!("image {} has no id", reference)))
    }

    /// Create a stopped container from `image`
    async fn create_from(&self, image: &ContainerHandle, config: Config<String>) -> Result<String> {
        let config = Config {
            image: Some(image.to_string()),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                network_mode: self.network.clone(),
                ..Default::default()
            }),
            ..config
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| Error::Backend(format!("Failed to create container: {}", e)))?;
        Ok(response.id)
    }

    /// Commit a container to a new image, applying `changes` to its config
    async fn commit(&self, container: &str, changes: Config<String>) -> Result<ContainerHandle> {
        let tag = Uuid::new_v4().simple().to_string();
        let options = CommitContainerOptions {
            container: container.to_string(),
            repo: STATE_REPO.to_string(),
            tag: tag.clone(),
            pause: true,
            ..Default::default()
        };

        let response = self
            .client
            .commit_container(options, changes)
            .await
            .map_err(|e| Error::Backend(format!("Failed to commit container: {}", e)))?;

        match response.id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(ContainerHandle::new(id)),
            None => self.image_id(&format!("{}:{}", STATE_REPO, tag)).await,
        }
    }

    async fn remove(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_container(container, Some(options)).await {
            warn!("Failed to remove container {}: {}", container, e);
        }
    }

    /// Derive a new state by changing only the image config
    async fn derive(&self, image: &ContainerHandle, changes: Config<String>) -> Result<ContainerHandle> {
        let container = self.create_from(image, Config::default()).await?;
        let result = self.commit(&container, changes).await;
        self.remove(&container).await;
        result
    }

    async fn run_config(
        &self,
        image: &ContainerHandle,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<(Config<String>, ImageConfig)> {
        let image_config = self.image_config(image).await?;
        let mut config = Config::default();
        if !args.is_empty() {
            config.cmd = Some(args.to_vec());
            let has_entrypoint = image_config
                .entrypoint
                .as_ref()
                .is_some_and(|e| !e.is_empty());
            if has_entrypoint && !opts.use_entrypoint {
                config.entrypoint = Some(vec![String::new()]);
            }
        }
        Ok((config, image_config))
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        let mut stream = self.client.wait_container::<String>(container, None);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Backend(format!(
                "container {} ended without an exit status",
                container
            ))),
        }
    }

    async fn logs(&self, container: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.client.logs(container, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read logs of {}: {}", container, e);
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    async fn host_of(&self, container: &str) -> Result<String> {
        let inspect = self.client.inspect_container(container, None).await?;
        let settings = inspect.network_settings.unwrap_or_default();

        let from_network = self.network.as_ref().and_then(|network| {
            settings
                .networks
                .as_ref()
                .and_then(|n| n.get(network))
                .and_then(|e| e.ip_address.clone())
        });

        from_network
            .or(settings.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::Backend(format!("container {} has no address", container)))
    }
}

/// Resolve a secret reference into its value
///
/// Supports `env://NAME` and `file://PATH`.
pub fn resolve_secret(secret_ref: &str) -> Result<String> {
    if let Some(name) = secret_ref.strip_prefix("env://") {
        return std::env::var(name)
            .map_err(|_| Error::InvalidSecret(format!("{} is not set", secret_ref)));
    }
    if let Some(path) = secret_ref.strip_prefix("file://") {
        return std::fs::read_to_string(path)
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|e| Error::InvalidSecret(format!("{}: {}", secret_ref, e)));
    }
    Err(Error::InvalidSecret(format!(
        "unsupported secret reference {}",
        secret_ref
    )))
}

/// Split `repo[:tag]` into repository and tag
fn split_reference(target: &str) -> (&str, &str) {
    match target.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (target, "latest"),
    }
}

/// Archive `source` so that it unpacks at `dest` when uploaded to `/`
fn archive_directory(source: &Path, dest: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let prefix = dest.trim_matches('/');
    let prefix = if prefix.is_empty() { "." } else { prefix };
    builder.append_dir_all(prefix, source)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn from_image(&self, image: &str) -> Result<ContainerHandle> {
        self.ensure_image(image).await?;
        self.image_id(image).await
    }

    async fn with_workdir(
        &self,
        container: &ContainerHandle,
        workdir: &str,
    ) -> Result<ContainerHandle> {
        let changes = Config {
            working_dir: Some(workdir.to_string()),
            ..Default::default()
        };
        self.derive(container, changes).await
    }

    async fn with_secret_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        secret_ref: &str,
    ) -> Result<ContainerHandle> {
        let value = resolve_secret(secret_ref)?;
        self.with_env_variable(container, name, &value).await
    }

    async fn with_env_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        value: &str,
    ) -> Result<ContainerHandle> {
        let changes = Config {
            env: Some(vec![format!("{}={}", name, value)]),
            ..Default::default()
        };
        self.derive(container, changes).await
    }

    async fn with_directory(
        &self,
        container: &ContainerHandle,
        path: &str,
        source: &Path,
    ) -> Result<ContainerHandle> {
        let dest = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            let workdir = self.image_config(container).await?.working_dir;
            let workdir = workdir.filter(|w| !w.is_empty()).unwrap_or_else(|| "/".to_string());
            PathBuf::from(workdir).join(path)
        };
        let dest = dest.to_string_lossy().into_owned();

        let source = source.to_path_buf();
        let archive = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || archive_directory(&source, &dest))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??
        };

        let step = self.create_from(container, Config::default()).await?;
        let upload = self
            .client
            .upload_to_container(
                &step,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| Error::Backend(format!("Failed to copy {} into container: {}", dest, e)));

        let result = match upload {
            Ok(()) => self.commit(&step, Config::default()).await,
            Err(e) => Err(e),
        };
        self.remove(&step).await;
        result
    }

    async fn with_exec(
        &self,
        container: &ContainerHandle,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecOutput> {
        let (config, image_config) = self.run_config(container, args, opts).await?;
        let step = self.create_from(container, config).await?;

        let run = async {
            self.client
                .start_container(&step, None::<StartContainerOptions<String>>)
                .await?;
            let exit_code = self.wait(&step).await?;
            let (stdout, stderr) = self.logs(&step).await;

            // Keep the image's own command for whoever runs it next
            let restore = Config {
                cmd: image_config.cmd.clone(),
                entrypoint: image_config.entrypoint.clone(),
                ..Default::default()
            };
            let state = self.commit(&step, restore).await?;
            Ok::<_, Error>(ExecOutput {
                state,
                exit_code,
                stdout,
                stderr,
            })
        }
        .await;

        self.remove(&step).await;
        let output = run?;
        debug!(
            "exec {:?} on {} exited with {}",
            args, container, output.exit_code
        );
        Ok(output)
    }

    async fn with_exposed_port(
        &self,
        container: &ContainerHandle,
        port: u16,
    ) -> Result<ContainerHandle> {
        let changes = Config {
            exposed_ports: Some(HashMap::from([(format!("{}/tcp", port), HashMap::new())])),
            ..Default::default()
        };
        self.derive(container, changes).await
    }

    async fn start_service(
        &self,
        container: &ContainerHandle,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ServiceHandle> {
        let (config, _) = self.run_config(container, args, opts).await?;
        let id = self.create_from(container, config).await?;
        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;

        // Give the command a moment to fail fast
        tokio::time::sleep(SERVICE_STARTUP_GRACE).await;
        let inspect = self.client.inspect_container(&id, None).await?;
        let state = inspect.state.unwrap_or_default();
        if !state.running.unwrap_or(false) {
            let exit_code = state.exit_code.unwrap_or(-1);
            if exit_code != 0 {
                let (stdout, stderr) = self.logs(&id).await;
                self.remove(&id).await;
                return Err(Error::CommandFailed {
                    exit_code,
                    stdout,
                    stderr,
                });
            }
        }

        let host = self.host_of(&id).await?;
        info!("Service {} started at {}", id, host);
        Ok(ServiceHandle { id, host })
    }

    async fn sync(&self, container: &ContainerHandle) -> Result<()> {
        self.client.inspect_image(container.as_str()).await?;
        Ok(())
    }

    async fn id(&self, container: &ContainerHandle) -> Result<ContainerId> {
        Ok(ContainerId::new(container.as_str()))
    }

    async fn load(&self, id: &ContainerId) -> Result<ContainerHandle> {
        self.image_id(id.as_str()).await
    }

    async fn publish(&self, container: &ContainerHandle, target: &str) -> Result<String> {
        let (repo, tag) = split_reference(target);
        self.client
            .tag_image(
                container.as_str(),
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;

        let mut stream = self.client.push_image(
            repo,
            Some(PushImageOptions {
                tag: tag.to_string(),
            }),
            None,
        );
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Backend(format!("Failed to push image: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::Backend(format!("Failed to push image: {}", error)));
            }
        }

        info!("Published {} as {}:{}", container, repo, tag);
        Ok(format!("{}:{}", repo, tag))
    }

    async fn terminal(&self, container: &ContainerHandle) -> Result<()> {
        let mut command = tokio::process::Command::new("docker");
        command.args(["run", "--rm", "-it"]);
        if let Some(network) = &self.network {
            command.args(["--network", network]);
        }
        let status = command
            .arg(container.as_str())
            .arg(&self.shell)
            .status()
            .await?;

        if !status.success() {
            return Err(Error::Backend(format!("terminal exited with {}", status)));
        }
        Ok(())
    }
}

/// Host tunnel made of socat sidecar containers
pub struct DockerTunnel {
    client: Docker,
    network: Option<String>,
    image: String,
}

impl DockerTunnel {
    pub fn new(client: Docker, network: Option<String>, image: impl Into<String>) -> Self {
        Self {
            client,
            network,
            image: image.into(),
        }
    }

    async fn start_forward(&self, service: &ServiceHandle, forward: PortForward) -> Result<String> {
        let port_key = format!("{}/tcp", forward.backend);
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                format!("TCP-LISTEN:{},fork,reuseaddr", forward.backend),
                format!("TCP:{}:{}", service.host, forward.backend),
            ]),
            exposed_ports: Some(HashMap::from([(port_key.clone(), HashMap::new())])),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "tunnel".to_string())])),
            host_config: Some(HostConfig {
                network_mode: self.network.clone(),
                port_bindings: Some(HashMap::from([(
                    port_key,
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".to_string()),
                        host_port: Some(forward.frontend.to_string()),
                    }]),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| Error::Tunnel(format!("Failed to create tunnel: {}", e)))?;
        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Tunnel(format!("Failed to start tunnel: {}", e)))?;

        debug!(
            "Tunnel 127.0.0.1:{} -> {}:{}",
            forward.frontend, service.host, forward.backend
        );
        Ok(response.id)
    }
}

#[async_trait]
impl HostTunnel for DockerTunnel {
    async fn start(
        &self,
        service: &ServiceHandle,
        forwards: &[PortForward],
    ) -> Result<TunnelHandle> {
        if self.client.inspect_image(&self.image).await.is_err() {
            let options = CreateImageOptions {
                from_image: self.image.clone(),
                ..Default::default()
            };
            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                result.map_err(|e| Error::Tunnel(format!("Failed to pull tunnel image: {}", e)))?;
            }
        }

        let mut ids = Vec::with_capacity(forwards.len());
        for forward in forwards {
            ids.push(self.start_forward(service, *forward).await?);
        }

        Ok(TunnelHandle {
            ids,
            host: "127.0.0.1".to_string(),
            forwards: forwards.to_vec(),
        })
    }

    async fn external_endpoint(&self, tunnel: &TunnelHandle, host_port: u16) -> Result<String> {
        if !tunnel.forwards.iter().any(|f| f.frontend == host_port) {
            return Err(Error::Tunnel(format!("port {} is not forwarded", host_port)));
        }
        Ok(format!("{}:{}", tunnel.host, host_port))
    }

    async fn internal_endpoint(&self, service: &ServiceHandle, port: u16) -> Result<String> {
        Ok(format!("{}:{}", service.host, port))
    }
}
