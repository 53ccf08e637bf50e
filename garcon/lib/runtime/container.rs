//! The container execution backend.
//!
//! Each managed server runs in one container named
//! `garcon-<server_id>`, labelled so the backend only ever operates on
//! containers it created. Crash detection rides the daemon's filtered event
//! stream with the status poll as fallback.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    system::EventsOptions,
    Docker,
};
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::{
    config::{cpu_limit_to_nano_cpus, parse_memory_limit, ServerConfig, Template},
    utils::{CONTAINER_NAME_PREFIX, MANAGED_LABEL, SERVER_ID_LABEL},
    GarconError, GarconResult,
};

use super::{CallbackHandle, ExecutionProvider, ExitCallback, ExitCallbackRegistry, ProcessStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed non-root identity containers run under.
const CONTAINER_USER: &str = "1000:1000";

/// Pause before re-opening a failed event stream.
const EVENT_STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The Docker-backed execution provider.
pub struct ContainerProvider {
    inner: Arc<ContainerProviderInner>,
}

struct ContainerProviderInner {
    docker: Docker,

    /// Server directories as the container daemon sees them, for bind-mount
    /// specifications.
    host_servers_dir: PathBuf,

    /// Cache of server id to container id. May lag ground truth; refreshed
    /// on demand and at reconciliation.
    containers: RwLock<HashMap<String, String>>,

    callbacks: ExitCallbackRegistry,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerProvider {
    /// Connects to the container daemon (honouring `DOCKER_HOST`) and wraps
    /// it in a provider.
    pub fn new(host_servers_dir: PathBuf) -> GarconResult<Self> {
        let docker = Docker::connect_with_defaults()?;
        Ok(Self::with_docker(docker, host_servers_dir))
    }

    /// Wraps an existing daemon handle. Used by callers that configure the
    /// connection themselves.
    pub fn with_docker(docker: Docker, host_servers_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(ContainerProviderInner {
                docker,
                host_servers_dir,
                containers: RwLock::new(HashMap::new()),
                callbacks: ExitCallbackRegistry::new(),
            }),
        }
    }

    /// The container name for a server.
    pub fn container_name(server_id: &str) -> String {
        format!("{}{}", CONTAINER_NAME_PREFIX, server_id)
    }

    /// Renders a command template, substituting every `{VAR}` token from the
    /// server's environment map.
    pub fn render_command(command: &str, environment: &HashMap<String, String>) -> String {
        let mut rendered = command.to_string();
        for (key, value) in environment {
            rendered = rendered.replace(&format!("{{{}}}", key), value);
        }
        rendered
    }

    /// Finds a container by exact name. The daemon's name filter matches
    /// substrings, so results are post-filtered for `/<name>`.
    async fn find_container_by_name(&self, name: &str) -> GarconResult<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let containers = self
            .inner
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let exact = format!("/{}", name);
        Ok(containers
            .into_iter()
            .find(|c| {
                c.names
                    .as_ref()
                    .map(|names| names.iter().any(|n| n == &exact))
                    .unwrap_or(false)
            })
            .and_then(|c| c.id))
    }

    /// Pulls the base image if it is not present locally, awaiting pull
    /// progress to completion.
    async fn ensure_image(&self, image: &str) -> GarconResult<()> {
        if self.inner.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("pulling image {}", image);
        let mut pull = self.inner.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = pull.next().await {
            progress?;
        }

        Ok(())
    }

    fn build_config(
        &self,
        config: &ServerConfig,
        template: &Template,
    ) -> GarconResult<Config<String>> {
        let container = template.get_container().as_ref().ok_or_else(|| {
            GarconError::validation(format!(
                "template '{}' has no container configuration",
                template.get_id()
            ))
        })?;

        // Template defaults first, then the server's map on top.
        let mut environment = container.get_environment().clone();
        environment.extend(config.environment.clone());

        let command = template
            .get_exec()
            .as_ref()
            .and_then(|e| e.get_command().as_ref())
            .map(|c| Self::render_command(c, &environment));

        let mut env: Vec<String> = vec![format!("HOME={}", container.get_mount_path())];
        env.extend(environment.iter().map(|(k, v)| format!("{}={}", k, v)));

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SERVER_ID_LABEL.to_string(), config.id.clone());

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for mapping in &config.ports {
            let key = format!("{}/{}", mapping.container_port, mapping.protocol.as_str());
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let host_data_path = self.inner.host_servers_dir.join(&config.id);
        let binds = vec![format!(
            "{}:{}",
            host_data_path.display(),
            container.get_mount_path()
        )];

        let mounts: Vec<Mount> = container
            .get_mounts()
            .iter()
            .map(|m| Mount {
                source: Some(m.get_host_path().clone()),
                target: Some(m.get_container_path().clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(*m.get_read_only()),
                ..Default::default()
            })
            .collect();

        let memory = config
            .memory_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;

        let nano_cpus = config.cpu_limit.map(cpu_limit_to_nano_cpus);

        let host_config = HostConfig {
            binds: Some(binds),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            port_bindings: Some(port_bindings),
            memory,
            nano_cpus,
            // Crashes are surfaced as an error state, never auto-recovered.
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        Ok(Config {
            image: Some(container.get_image().clone()),
            cmd: command.map(|c| vec!["/bin/sh".to_string(), "-c".to_string(), c]),
            env: Some(env),
            user: Some(CONTAINER_USER.to_string()),
            working_dir: container.get_workdir().clone(),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ExecutionProvider for ContainerProvider {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn check_availability(&self) -> bool {
        self.inner.docker.ping().await.is_ok()
    }

    async fn start_event_monitoring(&self) -> GarconResult<()> {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                let mut filters = HashMap::new();
                filters.insert("type".to_string(), vec!["container".to_string()]);
                filters.insert(
                    "event".to_string(),
                    vec!["die".to_string(), "stop".to_string()],
                );
                filters.insert(
                    "label".to_string(),
                    vec![format!("{}=true", MANAGED_LABEL)],
                );

                let mut events = inner.docker.events(Some(EventsOptions::<String> {
                    since: None,
                    until: None,
                    filters,
                }));

                tracing::debug!("container event stream opened");

                while let Some(event) = events.next().await {
                    match event {
                        Ok(message) => {
                            let attributes = message
                                .actor
                                .and_then(|a| a.attributes)
                                .unwrap_or_default();

                            let Some(server_id) = attributes.get(SERVER_ID_LABEL) else {
                                continue;
                            };

                            let exit_code = attributes
                                .get("exitCode")
                                .and_then(|c| c.parse::<i64>().ok());

                            tracing::info!(
                                server_id = %server_id,
                                exit_code = ?exit_code,
                                "container exited"
                            );
                            inner.callbacks.dispatch(server_id, exit_code);
                        }
                        Err(e) => {
                            tracing::warn!("container event stream error: {}", e);
                            break;
                        }
                    }
                }

                tracing::warn!(
                    "container event stream closed; reopening in {:?}",
                    EVENT_STREAM_RETRY_DELAY
                );
                tokio::time::sleep(EVENT_STREAM_RETRY_DELAY).await;
            }
        });

        Ok(())
    }

    fn on_process_exit(&self, callback: ExitCallback) -> CallbackHandle {
        self.inner.callbacks.register(callback)
    }

    async fn get_process_status(&self, server_id: &str) -> GarconResult<ProcessStatus> {
        let name = Self::container_name(server_id);

        let container_id = {
            let cached = self.inner.containers.read().await.get(server_id).cloned();
            match cached {
                Some(id) => Some(id),
                None => self.find_container_by_name(&name).await?,
            }
        };

        let Some(container_id) = container_id else {
            return Ok(ProcessStatus::default());
        };

        match self.inner.docker.inspect_container(&container_id, None).await {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);

                Ok(ProcessStatus {
                    exists: true,
                    running,
                    native_id: Some(container_id),
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // The cache lagged; drop the stale entry.
                self.inner.containers.write().await.remove(server_id);
                Ok(ProcessStatus::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start(
        &self,
        config: &ServerConfig,
        template: &Template,
        _data_path: &Path,
    ) -> GarconResult<String> {
        let status = self.get_process_status(&config.id).await?;
        if status.running {
            return Err(GarconError::conflict(format!(
                "server '{}' already has a running container",
                config.id
            )));
        }

        let container = template.get_container().as_ref().ok_or_else(|| {
            GarconError::validation(format!(
                "template '{}' has no container configuration",
                template.get_id()
            ))
        })?;

        self.ensure_image(container.get_image()).await?;

        // Any pre-existing container with this name is stale; remove it
        // before creating.
        let name = Self::container_name(&config.id);
        if let Some(stale) = self.find_container_by_name(&name).await? {
            tracing::info!(server_id = %config.id, "removing stale container before start");
            self.inner
                .docker
                .remove_container(
                    &stale,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        let container_config = self.build_config(config, template)?;

        let created = self
            .inner
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await?;

        self.inner
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;

        self.inner
            .containers
            .write()
            .await
            .insert(config.id.clone(), created.id.clone());

        tracing::info!(server_id = %config.id, container_id = %created.id, "container started");

        Ok(created.id)
    }

    async fn stop(
        &self,
        server_id: &str,
        template: &Template,
        timeout: Option<Duration>,
    ) -> GarconResult<()> {
        let status = self.get_process_status(server_id).await?;
        let Some(container_id) = status.native_id else {
            return Ok(());
        };

        let timeout_secs = timeout
            .map(|t| t.as_secs())
            .unwrap_or_else(|| template.stop_timeout_secs());

        if status.running {
            if let Err(e) = self
                .inner
                .docker
                .stop_container(
                    &container_id,
                    Some(StopContainerOptions {
                        t: timeout_secs as i64,
                    }),
                )
                .await
            {
                tracing::warn!(server_id = %server_id, "graceful container stop failed: {}", e);
            }
        }

        // The data lives on the bind mount; the container itself is
        // disposable and force-removed regardless.
        self.inner
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        self.inner.containers.write().await.remove(server_id);

        tracing::info!(server_id = %server_id, "container stopped and removed");

        Ok(())
    }

    async fn remove(&self, server_id: &str) -> GarconResult<()> {
        let name = Self::container_name(server_id);

        if let Some(container_id) = self.find_container_by_name(&name).await? {
            self.inner
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        self.inner.containers.write().await.remove(server_id);

        Ok(())
    }

    async fn reconcile(&self) -> GarconResult<()> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );

        let containers = self
            .inner
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut map = self.inner.containers.write().await;
        map.clear();

        for container in containers {
            let (Some(id), Some(labels)) = (container.id, container.labels) else {
                continue;
            };
            if let Some(server_id) = labels.get(SERVER_ID_LABEL) {
                map.insert(server_id.clone(), id);
            }
        }

        tracing::info!("reconciled {} managed containers", map.len());

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_command_substitutes_every_token() {
        let mut environment = HashMap::new();
        environment.insert("JAVA_OPTS".to_string(), "-Xmx4G".to_string());
        environment.insert("WORLD".to_string(), "alpha".to_string());

        let rendered = ContainerProvider::render_command(
            "java {JAVA_OPTS} -jar server.jar --world {WORLD} --backup {WORLD}",
            &environment,
        );

        assert_eq!(
            rendered,
            "java -Xmx4G -jar server.jar --world alpha --backup alpha"
        );
    }

    #[test]
    fn test_render_command_leaves_unknown_tokens() {
        let rendered = ContainerProvider::render_command("run {MISSING}", &HashMap::new());
        assert_eq!(rendered, "run {MISSING}");
    }

    #[test]
    fn test_container_name() {
        assert_eq!(
            ContainerProvider::container_name("alpha-0011223344"),
            "garcon-alpha-0011223344"
        );
    }
}
