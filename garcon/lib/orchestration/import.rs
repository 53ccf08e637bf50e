//! Server membership: import (create), configuration changes and delete.

use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;

use crate::{
    config::{PortMapping, ServerConfig, UpdateStage},
    events::ServerUpdateAction,
    runtime::ExecutionProvider,
    utils::generate_server_id,
    GarconError, GarconResult,
};

use super::{Orchestrator, ServerEntry, ServerStatus, ServerView};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request to import a pre-configured server directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportServerRequest {
    /// The display name.
    pub name: String,

    /// The template to run under.
    pub template_id: String,

    /// The directory to import.
    pub source_path: String,

    /// Port mappings; when omitted, each template default port maps host ==
    /// container.
    #[serde(default)]
    pub ports: Option<Vec<PortMapping>>,

    /// Environment overrides; merged over the template's defaults.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Optional memory limit string (`NNN[KMGT]`).
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Optional CPU quota in fractional cores.
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

/// A request to change a server's configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerRequest {
    /// A new display name.
    #[serde(default)]
    pub name: Option<String>,

    /// New port mappings.
    #[serde(default)]
    pub ports: Option<Vec<PortMapping>>,

    /// A new environment map (replaces the old one).
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,

    /// A new memory limit; an empty string clears it.
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// A new CPU quota; zero clears it.
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    /// Whether the maintenance routine restarts this server.
    #[serde(default)]
    pub restart_after_maintenance: Option<bool>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Imports a server: validates the source against the template, copies
    /// it into the managed tree, persists the sidecar and announces the new
    /// member.
    pub async fn import_server(
        &self,
        request: ImportServerRequest,
    ) -> GarconResult<ServerView> {
        let template = self.templates.get(&request.template_id)?;

        if !self.store.is_dir(&request.source_path).await {
            return Err(GarconError::validation(format!(
                "source path '{}' does not exist or is not a directory",
                request.source_path
            )));
        }

        for required in template.get_required_files() {
            let candidate = std::path::Path::new(&request.source_path).join(required);
            if !self.store.exists(&candidate).await {
                return Err(GarconError::validation(format!(
                    "required file '{}' is missing from the source directory",
                    required
                )));
            }
        }

        let server_id = generate_server_id(&request.name);
        let server_dir = self.settings.server_dir(&server_id);

        // Default ports: template defaults mapped host == container.
        let ports = request.ports.unwrap_or_else(|| {
            template
                .get_ports()
                .iter()
                .map(|spec| PortMapping {
                    host_port: *spec.get_container_port(),
                    container_port: *spec.get_container_port(),
                    protocol: *spec.get_protocol(),
                })
                .collect()
        });

        // Template defaults first, request overlay wins.
        let mut environment = template
            .get_container()
            .as_ref()
            .map(|c| c.get_environment().clone())
            .unwrap_or_default();
        environment.extend(request.environment);

        let now = Utc::now();
        let config = ServerConfig {
            id: server_id.clone(),
            name: request.name,
            template_id: request.template_id,
            source_path: request.source_path.clone(),
            created_at: now,
            updated_at: now,
            ports,
            environment,
            memory_limit: request.memory_limit,
            cpu_limit: request.cpu_limit,
            update_stage: UpdateStage::None,
            restart_after_maintenance: true,
        };

        self.store.copy_dir(&request.source_path, &server_dir).await?;

        let entry = ServerEntry::new(config, ServerStatus::Stopped);
        self.persist_sidecar(&entry).await?;

        self.servers
            .write()
            .await
            .insert(server_id.clone(), entry.clone());

        tracing::info!(server_id = %server_id, "server imported");
        self.events
            .publish_update(&server_id, ServerUpdateAction::Created)
            .await;

        Ok(self.view_of(&entry).await)
    }

    /// Changes a server's configuration.
    ///
    /// Renames are always allowed; everything else only takes effect at the
    /// next instance create, so those edits require the server stopped.
    pub async fn update_server(
        &self,
        server_id: &str,
        request: UpdateServerRequest,
    ) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        let runtime_fields_touched = request.ports.is_some()
            || request.environment.is_some()
            || request.memory_limit.is_some()
            || request.cpu_limit.is_some();

        {
            let mut state = entry.state.write().await;

            if runtime_fields_touched && state.status != ServerStatus::Stopped {
                return Err(GarconError::state(format!(
                    "cannot change runtime configuration of server '{}' while it is {}",
                    server_id, state.status
                )));
            }

            if let Some(name) = request.name {
                state.config.name = name;
            }
            if let Some(ports) = request.ports {
                state.config.ports = ports;
            }
            if let Some(environment) = request.environment {
                state.config.environment = environment;
            }
            if let Some(memory_limit) = request.memory_limit {
                state.config.memory_limit =
                    (!memory_limit.is_empty()).then_some(memory_limit);
            }
            if let Some(cpu_limit) = request.cpu_limit {
                state.config.cpu_limit = (cpu_limit > 0.0).then_some(cpu_limit);
            }
            if let Some(restart) = request.restart_after_maintenance {
                state.config.restart_after_maintenance = restart;
            }

            state.config.updated_at = Utc::now();
        }

        self.persist_sidecar(&entry).await?;
        self.events
            .publish_update(server_id, ServerUpdateAction::Updated)
            .await;

        Ok(self.view_of(&entry).await)
    }

    /// Deletes a server: removes the backend artefact and the data
    /// directory, drops the in-memory entry and announces the departure.
    /// Backups are preserved.
    pub async fn delete_server(&self, server_id: &str) -> GarconResult<()> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;

            match state.status {
                ServerStatus::Stopped | ServerStatus::Error => {}
                status => {
                    return Err(GarconError::state(format!(
                        "cannot delete server '{}' while it is {}",
                        server_id, status
                    )));
                }
            }

            if state.config.update_stage.is_active() {
                return Err(GarconError::state(format!(
                    "cannot delete server '{}' while an update is in progress",
                    server_id
                )));
            }
        }

        // Template gone: fall back to the container backend so the artefact
        // (if any) still gets cleaned up.
        let provider = match self.template_and_provider(&entry).await {
            Ok((_, provider)) => provider,
            Err(_) => self.providers.container.clone(),
        };

        provider.remove(server_id).await?;
        self.store
            .remove_dir(self.settings.server_dir(server_id))
            .await?;

        self.servers.write().await.remove(server_id);

        tracing::info!(server_id = %server_id, "server deleted");
        self.events
            .publish_update(server_id, ServerUpdateAction::Deleted)
            .await;

        Ok(())
    }
}
