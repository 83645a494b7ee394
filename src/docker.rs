//! Docker runtime for job containers
//!
//! Job containers are locked down: all capabilities dropped,
//! `no-new-privileges`, the nvidia runtime with a single visible device,
//! a pids limit, a RAM reservation and a writable-layer disk quota.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::image::{CreateImageOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Port the notebook server listens on inside the container
pub const NOTEBOOK_CONTAINER_PORT: &str = "8888/tcp";

/// Maximum number of processes inside a job container
pub const PIDS_LIMIT: i64 = 200;

/// Everything needed to create a job container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    /// `host:container:mode` bind strings
    pub binds: Vec<String>,
    /// Writable layer quota in bytes
    pub disk_quota: u64,
    /// RAM reservation and swap limit in bytes
    pub memory: u64,
    /// Host port for the notebook server, notebook jobs only
    pub notebook_port: Option<u16>,
}

/// Disk usage reported by the daemon for one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerUsage {
    pub size_rw: i64,
    pub size_root_fs: i64,
}

/// Registry credentials for image pulls
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Container daemon operations used by the executor
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str, auth: &RegistryAuth) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Follow stdout and stderr until the container exits.
    fn logs(&self, id: &str) -> LogStream;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Remove untagged images left behind by job pulls.
    async fn prune_dangling_images(&self) -> Result<()>;

    async fn container_usage(&self, id: &str) -> Result<ContainerUsage>;

    /// One-shot stats as reported by the daemon
    async fn container_stats(&self, id: &str) -> Result<serde_json::Value>;
}

/// Build the daemon-level config for a job container.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut storage_opt = HashMap::new();
    storage_opt.insert("size".to_string(), spec.disk_quota.to_string());

    let memory = spec.memory as i64;
    let mut host_config = HostConfig {
        binds: Some(spec.binds.clone()),
        storage_opt: Some(storage_opt),
        memory_reservation: Some(memory),
        memory_swap: Some(memory),
        pids_limit: Some(PIDS_LIMIT),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        runtime: Some("nvidia".to_string()),
        auto_remove: Some(false),
        ..Default::default()
    };

    let mut exposed_ports = None;
    if let Some(port) = spec.notebook_port {
        let mut bindings = HashMap::new();
        bindings.insert(
            NOTEBOOK_CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
        host_config.port_bindings = Some(bindings);

        let mut exposed = HashMap::new();
        exposed.insert(NOTEBOOK_CONTAINER_PORT.to_string(), HashMap::new());
        exposed_ports = Some(exposed);
    }

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports,
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Filter selecting untagged images only. Tagged images stay cached.
pub fn dangling_images() -> PruneImagesOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("dangling".to_string(), vec!["true".to_string()]);
    PruneImagesOptions { filters }
}

/// [`ContainerRuntime`] backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow!("Failed to connect to Docker: {}", e))?;

        docker
            .ping()
            .await
            .map_err(|e| anyhow!("Failed to ping Docker: {}", e))?;

        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str, auth: &RegistryAuth) -> Result<()> {
        info!("Pulling image: {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let credentials = DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.server.clone()),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, Some(credentials));
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(anyhow!("Failed to pull image: {}", e)),
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| anyhow!("Failed to create container: {}", e))?;

        info!("Created container: {}", response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow!("Failed to start container: {}", e))?;

        info!("Started container: {}", id);
        Ok(())
    }

    fn logs(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(message))
                    }
                    Ok(LogOutput::Console { message }) => Some(Ok(message)),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(anyhow!("Error reading logs: {}", e))),
                }
            })
            .boxed()
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| anyhow!("Failed to remove container: {}", e))?;

        debug!("Removed container: {}", id);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(|e| anyhow!("Failed to remove image {}: {}", image, e))?;

        debug!("Removed image: {}", image);
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<()> {
        let pruned = self
            .docker
            .prune_images(Some(dangling_images()))
            .await
            .map_err(|e| anyhow!("Failed to prune dangling images: {}", e))?;
        debug!(
            "Pruned dangling images, reclaimed {} bytes",
            pruned.space_reclaimed.unwrap_or_default()
        );
        Ok(())
    }

    async fn container_usage(&self, id: &str) -> Result<ContainerUsage> {
        let inspect = self
            .docker
            .inspect_container(id, Some(InspectContainerOptions { size: true }))
            .await
            .map_err(|e| anyhow!("Failed to inspect container: {}", e))?;

        Ok(ContainerUsage {
            size_rw: inspect.size_rw.unwrap_or(0),
            size_root_fs: inspect.size_root_fs.unwrap_or(0),
        })
    }

    async fn container_stats(&self, id: &str) -> Result<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(serde_json::to_value(stats)?),
            Some(Err(e)) => Err(anyhow!("Failed to read container stats: {}", e)),
            None => Err(anyhow!("No stats returned for container {}", id)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory daemon. Records every call in order.
    pub(crate) struct FakeRuntime {
        pub calls: Mutex<Vec<String>>,
        /// Also fed by other fakes, for ordering across them
        pub sequence: Arc<Mutex<Vec<String>>>,
        pub specs: Mutex<Vec<ContainerSpec>>,
        pub usage: Mutex<ContainerUsage>,
        /// Emitted by `logs`
        pub log_output: Vec<Bytes>,
        /// Keep the log stream open after the output is emitted
        pub hold_logs: bool,
        /// Written into the bound output dir when the container starts
        pub output_files: Vec<(String, Vec<u8>)>,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                sequence: Arc::default(),
                specs: Mutex::new(Vec::new()),
                usage: Mutex::new(ContainerUsage::default()),
                log_output: vec![Bytes::from_static(b"hello\n")],
                hold_logs: false,
                output_files: vec![("result.txt".to_string(), b"42\n".to_vec())],
            }
        }
    }

    impl FakeRuntime {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.sequence.lock().push(call.clone());
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull_image(&self, image: &str, auth: &RegistryAuth) -> Result<()> {
            self.record(format!("pull {} as {}", image, auth.username));
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(format!("create {}", spec.name));
            self.specs.lock().push(spec.clone());
            Ok("c1".to_string())
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            self.record(format!("start {}", id));
            let spec = self.specs.lock().last().cloned();
            let output = spec.and_then(|s| {
                s.binds
                    .iter()
                    .find(|b| b.contains(":/home/user/output:"))
                    .and_then(|b| b.split(':').next().map(str::to_string))
            });
            if let Some(dir) = output {
                for (name, contents) in &self.output_files {
                    std::fs::write(std::path::Path::new(&dir).join(name), contents)?;
                }
            }
            Ok(())
        }

        fn logs(&self, id: &str) -> LogStream {
            self.record(format!("logs {}", id));
            let chunks = futures::stream::iter(
                self.log_output
                    .clone()
                    .into_iter()
                    .map(Ok::<Bytes, anyhow::Error>),
            );
            if self.hold_logs {
                chunks.chain(futures::stream::pending::<Result<Bytes>>()).boxed()
            } else {
                chunks.boxed()
            }
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.record(format!("remove {}", id));
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<()> {
            self.record(format!("rmi {}", image));
            Ok(())
        }

        async fn prune_dangling_images(&self) -> Result<()> {
            self.record("prune".to_string());
            Ok(())
        }

        async fn container_usage(&self, _id: &str) -> Result<ContainerUsage> {
            Ok(*self.usage.lock())
        }

        async fn container_stats(&self, id: &str) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "id": id, "pids_stats": { "current": 3 } }))
        }
    }

    fn spec(notebook_port: Option<u16>) -> ContainerSpec {
        ContainerSpec {
            name: "emrys-j1".to_string(),
            image: "registry.emrys.io/miner/j1:latest".to_string(),
            env: vec!["NVIDIA_VISIBLE_DEVICES=0".to_string()],
            binds: vec![
                "/home/u/.emrys/j1/data:/home/user/data:rw".to_string(),
                "/home/u/.emrys/j1/output:/home/user/output:rw".to_string(),
            ],
            disk_quota: 24_000_000_000,
            memory: 8_000_000_000,
            notebook_port,
        }
    }

    #[test]
    fn test_container_config_sandbox() {
        let config = container_config(&spec(None));
        let host = config.host_config.unwrap();
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges".to_string()])
        );
        assert_eq!(host.runtime.as_deref(), Some("nvidia"));
        assert_eq!(host.pids_limit, Some(200));
        assert_eq!(host.memory_reservation, Some(8_000_000_000));
        assert_eq!(host.memory_swap, Some(8_000_000_000));
        assert_eq!(
            host.storage_opt.unwrap().get("size").map(String::as_str),
            Some("24000000000")
        );
        assert_eq!(host.binds.unwrap().len(), 2);
        assert!(host.port_bindings.is_none());
        assert!(config.exposed_ports.is_none());
        assert_eq!(
            config.env,
            Some(vec!["NVIDIA_VISIBLE_DEVICES=0".to_string()])
        );
    }

    #[test]
    fn test_container_config_notebook_port() {
        let config = container_config(&spec(Some(8901)));
        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings[NOTEBOOK_CONTAINER_PORT].as_ref().unwrap();
        assert_eq!(binding[0].host_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(binding[0].host_port.as_deref(), Some("8901"));
        assert!(config
            .exposed_ports
            .unwrap()
            .contains_key(NOTEBOOK_CONTAINER_PORT));
    }

    #[test]
    fn test_prune_only_touches_dangling_images() {
        let options = dangling_images();
        assert_eq!(options.filters.len(), 1);
        assert_eq!(
            options.filters.get("dangling"),
            Some(&vec!["true".to_string()])
        );
    }
}
