//! Per-server runtime state and the locking discipline that serializes
//! transitions.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::{
    config::{PortMapping, ServerConfig, UpdateStage},
    GarconError, GarconResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle status of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// No instance is running.
    Stopped,

    /// A start transition is in flight.
    Starting,

    /// The instance is alive.
    Running,

    /// A stop transition is in flight.
    Stopping,

    /// The instance exited unexpectedly; awaiting operator acknowledgement.
    Error,

    /// The three-phase update protocol is in progress.
    Updating,
}

/// The in-memory runtime state of one server, rebuilt from the sidecar and
/// backend ground truth on startup.
#[derive(Debug)]
pub struct ServerRuntime {
    /// The persisted configuration; the sidecar is authoritative.
    pub config: ServerConfig,

    /// The current lifecycle status.
    pub status: ServerStatus,

    /// When the instance started. Across a control-plane restart this is a
    /// lower bound; the true value is lost.
    pub started_at: Option<DateTime<Utc>>,

    /// The pre-update backup taken by the current update, if one is in
    /// progress.
    pub pre_update_backup: Option<DateTime<Utc>>,
}

/// One managed server: short-held state plus a transition lock held for the
/// duration of each lifecycle operation (including its sidecar write).
#[derive(Debug)]
pub struct ServerEntry {
    /// Runtime state; lock briefly for reads and writes.
    pub state: RwLock<ServerRuntime>,

    /// Serializes transitions. A second transition for the same server
    /// while one is in flight is rejected with a state-conflict error.
    transition: Mutex<()>,
}

/// The response view of a server handed to the facade.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerView {
    /// The server id.
    pub id: String,

    /// The display name.
    pub name: String,

    /// The template the server runs under.
    pub template_id: String,

    /// The template's display name, when the template still exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,

    /// The current lifecycle status.
    pub status: ServerStatus,

    /// When the instance started, for running servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Progress through the update protocol.
    pub update_stage: UpdateStage,

    /// Port mappings.
    pub ports: Vec<PortMapping>,

    /// Environment variables.
    pub environment: HashMap<String, String>,

    /// Optional memory limit string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    /// Optional CPU quota in fractional cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,

    /// The original import location.
    pub source_path: String,

    /// When the server was imported.
    pub created_at: DateTime<Utc>,

    /// When the server last changed.
    pub updated_at: DateTime<Utc>,

    /// Whether the maintenance routine restarts this server.
    pub restart_after_maintenance: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerEntry {
    /// Creates an entry for a server in the given status.
    pub fn new(config: ServerConfig, status: ServerStatus) -> Arc<Self> {
        let started_at = match status {
            ServerStatus::Running => Some(Utc::now()),
            _ => None,
        };

        Arc::new(Self {
            state: RwLock::new(ServerRuntime {
                config,
                status,
                started_at,
                pre_update_backup: None,
            }),
            transition: Mutex::new(()),
        })
    }

    /// Begins a transition, rejecting with a state-conflict error when
    /// another transition for this server is already in flight.
    pub fn begin_transition(&self) -> GarconResult<MutexGuard<'_, ()>> {
        self.transition.try_lock().map_err(|_| {
            GarconError::conflict("another operation is in progress for this server")
        })
    }

    /// Waits for the in-flight transition (if any) and begins a new one.
    /// Used by the crash handler, which must not be rejected.
    pub async fn begin_transition_blocking(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().await
    }

    /// Builds the response view, resolving the template name through the
    /// given lookup.
    pub async fn view(&self, template_name: Option<String>) -> ServerView {
        let state = self.state.read().await;

        ServerView {
            id: state.config.id.clone(),
            name: state.config.name.clone(),
            template_id: state.config.template_id.clone(),
            template_name,
            status: state.status,
            started_at: state.started_at,
            update_stage: state.config.update_stage,
            ports: state.config.ports.clone(),
            environment: state.config.environment.clone(),
            memory_limit: state.config.memory_limit.clone(),
            cpu_limit: state.config.cpu_limit,
            source_path: state.config.source_path.clone(),
            created_at: state.config.created_at,
            updated_at: state.config.updated_at,
            restart_after_maintenance: state.config.restart_after_maintenance,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error => "error",
            ServerStatus::Updating => "updating",
        };
        f.write_str(s)
    }
}
