//! Docker implementation of the provider capability interface.
//!
//! Containers are labeled with their owning instance so orphans can be
//! swept even after the provisioning process is gone. Resource limits map
//! onto `HostConfig`; a `Deny` network policy becomes `network_mode: none`.
//! Docker cannot enforce a CIDR egress allowlist or idle/overall timeouts,
//! so those are recorded as labels and logged.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ConnectionInfo, ContainerHandle, ContainerProvider, ExecOutput, ExecRequest};
use crate::error::{Result, SandboxError};
use crate::spec::{ContainerSpec, ImageSource, NetworkPolicy};

/// Label key identifying the owning instance.
pub const INSTANCE_LABEL: &str = "sandpit.instance";
/// Label key identifying the service name.
pub const SERVICE_LABEL: &str = "sandpit.service";

/// Docker-backed [`ContainerProvider`].
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connects to the local Docker daemon and verifies it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::provider_unavailable(format!(
                "failed to connect to Docker; is Docker running? {e}"
            ))
        })?;

        docker.ping().await.map_err(|e| {
            SandboxError::provider_unavailable(format!(
                "cannot ping Docker daemon; is Docker running? {e}"
            ))
        })?;

        Ok(Self { docker })
    }

    /// Resolves the spec's image reference to a runnable local image tag,
    /// pulling or building as needed.
    async fn ensure_image(&self, spec: &ContainerSpec) -> Result<String> {
        match &spec.image {
            ImageSource::Registry(image) => {
                if self.docker.inspect_image(image).await.is_err() {
                    self.pull_image(image).await?;
                }
                Ok(image.clone())
            }
            ImageSource::Build {
                context,
                dockerfile,
            } => {
                // Cached by source path: a multi-service build config builds
                // once, repeated instances reuse the image. Dockerfile edits
                // need a `docker rmi` of the tag to take effect.
                let tag = build_tag(context, dockerfile);
                if self.docker.inspect_image(&tag).await.is_err() {
                    self.build_image(context, dockerfile, &tag).await?;
                } else {
                    debug!(%tag, "reusing previously built image");
                }
                Ok(tag)
            }
        }
    }

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(|e| {
                SandboxError::exec_failure(format!("failed to pull image '{image}': {e}"))
            })?;
            if let Some(error) = output.error {
                return Err(SandboxError::exec_failure(format!(
                    "failed to pull image '{image}': {error}"
                )));
            }
        }
        Ok(())
    }

    /// Builds an image from a Dockerfile, streaming the build output at
    /// debug level.
    async fn build_image(&self, context: &Path, dockerfile: &Path, tag: &str) -> Result<()> {
        if !dockerfile.is_file() {
            return Err(SandboxError::config_not_found(
                dockerfile.display().to_string(),
            ));
        }

        let dockerfile_rel = dockerfile
            .strip_prefix(context)
            .unwrap_or(dockerfile)
            .display()
            .to_string();
        info!(context = %context.display(), dockerfile = %dockerfile_rel, tag, "building image");

        let options = BuildImageOptions {
            dockerfile: dockerfile_rel,
            t: tag.to_string(),
            ..Default::default()
        };

        // The daemon consumes the build context as an in-memory tarball.
        let mut tar_buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_buf);
            builder.append_dir_all(".", context).map_err(|e| {
                SandboxError::io_failure(format!(
                    "failed to tar build context {}: {e}",
                    context.display()
                ))
            })?;
            builder
                .finish()
                .map_err(|e| SandboxError::io_failure(format!("failed to finalize tarball: {e}")))?;
        }

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(tar_buf)));
        while let Some(chunk) = stream.next().await {
            let output = chunk
                .map_err(|e| SandboxError::exec_failure(format!("image build failed: {e}")))?;
            if let Some(text) = &output.stream {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    debug!(tag, "{trimmed}");
                }
            }
            if let Some(error) = output.error {
                return Err(SandboxError::exec_failure(format!(
                    "image build failed: {error}"
                )));
            }
        }
        Ok(())
    }

    /// Removes every container labeled as sandpit-owned, optionally scoped
    /// to one instance. Returns the number removed.
    pub async fn cleanup_orphaned(&self, instance_id: Option<&str>) -> Result<u32> {
        let label = match instance_id {
            Some(id) => format!("{INSTANCE_LABEL}={id}"),
            None => INSTANCE_LABEL.to_string(),
        };
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::exec_failure(format!("failed to list containers: {e}")))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    info!(container = %id, "removed orphaned container");
                    removed += 1;
                }
                Err(e) => warn!(container = %id, error = %e, "failed to remove orphaned container"),
            }
        }
        Ok(removed)
    }

    fn labels(instance_id: &str, spec: &ContainerSpec) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (INSTANCE_LABEL.to_string(), instance_id.to_string()),
            (SERVICE_LABEL.to_string(), spec.service.clone()),
            (
                "sandpit.timeout".to_string(),
                spec.timeout.as_secs().to_string(),
            ),
        ]);
        if let Some(idle) = spec.idle_timeout {
            labels.insert("sandpit.idle_timeout".to_string(), idle.as_secs().to_string());
        }
        if let Some(cloud) = &spec.cloud {
            labels.insert("sandpit.cloud".to_string(), cloud.clone());
        }
        if let Some(region) = &spec.region {
            labels.insert("sandpit.region".to_string(), region.clone());
        }
        labels
    }
}

/// Deterministic local image tag for a Dockerfile build, keyed by the
/// context and dockerfile paths.
fn build_tag(context: &Path, dockerfile: &Path) -> String {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    context.hash(&mut hasher);
    dockerfile.hash(&mut hasher);
    format!("sandpit-build-{:016x}", hasher.finish())
}

/// Maps a Docker API error for an existing-container operation.
fn container_error(context: &str, err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => SandboxError::container_gone(message),
        other => SandboxError::exec_failure(format!("{context}: {other}")),
    }
}

/// Extracts the first regular file from a tar archive produced by
/// `download_from_container`.
fn file_from_tar(archive_bytes: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive_bytes);
    let entries = archive
        .entries()
        .map_err(|e| SandboxError::io_failure(format!("invalid archive for '{path}': {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| SandboxError::io_failure(format!("invalid archive entry: {e}")))?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| SandboxError::io_failure(format!("failed to read '{path}': {e}")))?;
            return Ok(contents);
        }
    }
    Err(SandboxError::file_not_found(path))
}

/// Builds a single-file tar archive for `upload_to_container`.
fn tar_single_file(name: &str, contents: &[u8]) -> Result<Bytes> {
    let mut tar_buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_buf);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents)
            .map_err(|e| SandboxError::io_failure(format!("failed to archive '{name}': {e}")))?;
        builder
            .finish()
            .map_err(|e| SandboxError::io_failure(format!("failed to finalize archive: {e}")))?;
    }
    Ok(Bytes::from(tar_buf))
}

/// Splits an absolute container path into (parent directory, file name).
fn split_container_path(path: &str) -> (String, String) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

/// Classifies file-transfer errors by the daemon's message text; the API
/// reports them all as generic server errors.
fn transfer_error(path: &str, err: DockerError) -> SandboxError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("no such container") {
        SandboxError::container_gone(text)
    } else if lowered.contains("permission denied") {
        SandboxError::permission_denied(path)
    } else if lowered.contains("no such file")
        || lowered.contains("not found")
        || lowered.contains("could not find")
    {
        SandboxError::file_not_found(path)
    } else {
        SandboxError::io_failure(text)
    }
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_container(
        &self,
        instance_id: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle> {
        let image = self.ensure_image(spec).await?;

        let container_name = format!(
            "sandpit-{}",
            uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
        );

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut host_config = bollard::service::HostConfig {
            memory: spec.memory_bytes,
            #[allow(clippy::cast_possible_truncation)]
            nano_cpus: spec.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        match &spec.network {
            NetworkPolicy::Deny => {
                host_config.network_mode = Some("none".to_string());
            }
            NetworkPolicy::Allowlist(cidrs) => {
                // Plain Docker has no egress CIDR filter; a capable provider
                // enforces this policy, Docker only records it.
                warn!(
                    service = %spec.service,
                    cidrs = %cidrs.join(","),
                    "CIDR allowlist is not enforceable on Docker; allowing all egress"
                );
            }
            NetworkPolicy::AllowAll => {}
        }

        let config = ContainerConfig {
            image: Some(image),
            working_dir: spec.working_dir.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(Self::labels(instance_id, spec)),
            // Keep PID 1 alive so the container stays an exec target.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(instance = instance_id, service = %spec.service, container = %container_name, "creating container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                SandboxError::exec_failure(format!(
                    "failed to create container for '{}': {e}",
                    spec.service
                ))
            })?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&created.id, None)
            .await
        {
            // Do not leak the created-but-unstartable container.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(SandboxError::exec_failure(format!(
                "failed to start container for '{}': {e}",
                spec.service
            )));
        }

        Ok(ContainerHandle::new(created.id, &spec.service, instance_id))
    }

    async fn exec(&self, handle: &ContainerHandle, request: ExecRequest) -> Result<ExecOutput> {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                &handle.provider_id,
                CreateExecOptions {
                    cmd: Some(request.command.clone()),
                    attach_stdin: Some(request.input.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: request.workdir.clone(),
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| container_error("failed to create exec", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            output: mut stream,
            input: mut stdin,
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| container_error("failed to start exec", e))?
        {
            if let Some(bytes) = &request.input {
                stdin.write_all(bytes).await.map_err(|e| {
                    SandboxError::io_failure(format!("failed to write exec stdin: {e}"))
                })?;
                // Close stdin so commands that read to EOF can finish.
                stdin.shutdown().await.map_err(|e| {
                    SandboxError::io_failure(format!("failed to close exec stdin: {e}"))
                })?;
            }

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        return Err(SandboxError::exec_failure(format!(
                            "error reading exec output: {e}"
                        )));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| container_error("failed to inspect exec", e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn read_file(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut archive_bytes = Vec::new();
        let mut stream = self
            .docker
            .download_from_container(&handle.provider_id, Some(options));
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| transfer_error(path, e))?;
            archive_bytes.extend_from_slice(&bytes);
        }

        file_from_tar(&archive_bytes, path)
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let (parent, name) = split_container_path(path);

        // Ensure the destination directory exists; the upload API will not
        // create it.
        let mkdir = self
            .exec(
                handle,
                ExecRequest::new(vec![
                    "mkdir".to_string(),
                    "-p".to_string(),
                    parent.clone(),
                ]),
            )
            .await?;
        if !mkdir.success() {
            return Err(SandboxError::permission_denied(parent));
        }

        let archive = tar_single_file(&name, contents)?;
        self.docker
            .upload_to_container(
                &handle.provider_id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| transfer_error(path, e))
    }

    async fn connection(&self, handle: &ContainerHandle) -> Result<Option<ConnectionInfo>> {
        let inspect = self
            .docker
            .inspect_container(&handle.provider_id, None)
            .await
            .map_err(|e| container_error("failed to inspect container", e))?;

        let host = inspect
            .network_settings
            .and_then(|settings| settings.ip_address)
            .filter(|ip| !ip.is_empty());

        Ok(host.map(|host| ConnectionInfo {
            host,
            port: None,
            credentials: None,
        }))
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<()> {
        match self
            .docker
            .remove_container(
                &handle.provider_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone or already being removed: terminate is idempotent.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::exec_failure(format!(
                "failed to remove container '{}': {e}",
                handle.provider_id
            ))),
        }
    }
}
