//! The server orchestrator: owns the per-server state machines, coordinates
//! the execution providers and the backup engine, and publishes every
//! transition on the event bus.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{
    backup::BackupEngine,
    config::{ExecutionMode, ServerConfig, Settings, Template},
    events::EventBus,
    runtime::{CallbackHandle, ExecutionProvider, ExitCallback},
    store::FileStore,
    templates::TemplateRegistry,
    utils::{SERVER_ORDER_FILENAME, SIDECAR_FILENAME},
    GarconError, GarconResult,
};

use super::{ServerEntry, ServerStatus, ServerView};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The execution backends the orchestrator dispatches to, selected by the
/// template's execution mode.
#[derive(Clone)]
pub struct ExecutionProviders {
    /// The container backend.
    pub container: Arc<dyn ExecutionProvider>,

    /// The native-process backend.
    pub native: Arc<dyn ExecutionProvider>,
}

/// Owns the per-server state machine and coordinates every side effect of a
/// transition.
pub struct Orchestrator {
    pub(super) settings: Settings,
    pub(super) store: FileStore,
    pub(super) templates: Arc<TemplateRegistry>,
    pub(super) backups: Arc<BackupEngine>,
    pub(super) providers: ExecutionProviders,
    pub(super) events: Arc<EventBus>,
    pub(super) servers: RwLock<HashMap<String, Arc<ServerEntry>>>,

    /// Keeps the crash callbacks registered for the orchestrator's lifetime.
    callback_handles: std::sync::Mutex<Vec<CallbackHandle>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionProviders {
    /// The provider responsible for a template's execution mode.
    pub fn for_mode(&self, mode: ExecutionMode) -> Arc<dyn ExecutionProvider> {
        match mode {
            ExecutionMode::Container => self.container.clone(),
            ExecutionMode::Native => self.native.clone(),
        }
    }
}

impl Orchestrator {
    /// Creates an orchestrator. Call [`Orchestrator::initialize`] afterwards
    /// to reconcile against on-disk and backend ground truth.
    pub fn new(
        settings: Settings,
        store: FileStore,
        templates: Arc<TemplateRegistry>,
        backups: Arc<BackupEngine>,
        providers: ExecutionProviders,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            templates,
            backups,
            providers,
            events,
            servers: RwLock::new(HashMap::new()),
            callback_handles: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Rebuilds in-memory state from the servers directory and the backends,
    /// registers the crash callback and starts event monitoring.
    ///
    /// Directories without a valid sidecar are skipped with a warning. An
    /// unreachable container daemon is logged and startup continues so the
    /// operator can still see configured servers.
    pub async fn initialize(self: &Arc<Self>) -> GarconResult<()> {
        for provider in [&self.providers.container, &self.providers.native] {
            if let Err(e) = provider.reconcile().await {
                tracing::warn!(
                    provider = provider.name(),
                    "backend reconciliation failed: {}",
                    e
                );
            }
        }

        let servers_dir = self.settings.servers_dir();
        self.store.ensure_dir(&servers_dir).await?;

        let mut servers = HashMap::new();
        for dir_name in self.store.list_dirs(&servers_dir).await? {
            let sidecar = servers_dir.join(&dir_name).join(SIDECAR_FILENAME);

            let config: ServerConfig = match self.store.read_yaml(&sidecar).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        "skipping server directory '{}': no valid sidecar ({})",
                        dir_name,
                        e
                    );
                    continue;
                }
            };

            let status = self.derive_initial_status(&config).await;
            tracing::info!(server_id = %config.id, status = %status, "reconciled server");
            servers.insert(config.id.clone(), ServerEntry::new(config, status));
        }

        *self.servers.write().await = servers;

        // Register the crash callback with both backends, then start their
        // event monitoring.
        let weak = Arc::downgrade(self);
        let callback: ExitCallback = Arc::new(move |server_id, exit_code| {
            let Some(orchestrator) = weak.upgrade() else {
                return;
            };
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                orchestrator.handle_process_exit(&server_id, exit_code).await;
            });
        });

        let mut handles = Vec::new();
        for provider in [&self.providers.container, &self.providers.native] {
            handles.push(provider.on_process_exit(callback.clone()));
            provider.start_event_monitoring().await?;
        }
        *self
            .callback_handles
            .lock()
            .expect("callback handle list poisoned") = handles;

        Ok(())
    }

    /// Derives the initial status of a reconciled server from backend ground
    /// truth and the persisted update stage.
    async fn derive_initial_status(&self, config: &ServerConfig) -> ServerStatus {
        let provider = match self.templates.lookup(&config.template_id) {
            Some(template) => self.providers.for_mode(*template.get_mode()),
            None => {
                tracing::warn!(
                    server_id = %config.id,
                    template_id = %config.template_id,
                    "template missing; assuming container mode for reconciliation"
                );
                self.providers.container.clone()
            }
        };

        match provider.get_process_status(&config.id).await {
            Ok(status) if status.running => ServerStatus::Running,
            Ok(_) if config.update_stage.is_active() => ServerStatus::Updating,
            Ok(_) => ServerStatus::Stopped,
            Err(e) => {
                // Backend unreachable: fall back to the persisted stage. A
                // container that is actually running will be misreported as
                // stopped until the daemon is back.
                tracing::warn!(
                    server_id = %config.id,
                    "backend status query failed during reconciliation: {}",
                    e
                );
                if config.update_stage.is_active() {
                    ServerStatus::Updating
                } else {
                    ServerStatus::Stopped
                }
            }
        }
    }

    /// Handles an exit notification from a backend.
    ///
    /// Exits observed while the server was believed starting or running are
    /// crashes: the server lands in `error` and stays there until the
    /// operator acknowledges. Exits during `stopping`, `updating` or
    /// `stopped` are expected or already reconciled and are ignored.
    pub async fn handle_process_exit(&self, server_id: &str, exit_code: Option<i64>) {
        let Some(entry) = self.servers.read().await.get(server_id).cloned() else {
            return;
        };

        let _guard = entry.begin_transition_blocking().await;

        let status = entry.state.read().await.status;
        match status {
            ServerStatus::Running | ServerStatus::Starting => {
                tracing::warn!(
                    server_id = %server_id,
                    exit_code = ?exit_code,
                    "server exited unexpectedly"
                );

                {
                    let mut state = entry.state.write().await;
                    state.status = ServerStatus::Error;
                    state.started_at = None;
                }
                self.publish_current(&entry).await;
            }
            _ => {
                tracing::debug!(
                    server_id = %server_id,
                    status = %status,
                    "ignoring exit notification"
                );
            }
        }
    }

    /// Lists all servers, ordered by the persisted ordering document and
    /// then by creation time.
    pub async fn list_servers(&self) -> Vec<ServerView> {
        let entries: Vec<Arc<ServerEntry>> = self.servers.read().await.values().cloned().collect();

        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            views.push(self.view_of(&entry).await);
        }

        let order = self.load_order().await;
        let position = |id: &str| {
            order
                .iter()
                .position(|o| o == id)
                .unwrap_or(usize::MAX)
        };
        views.sort_by(|a, b| {
            position(&a.id)
                .cmp(&position(&b.id))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        views
    }

    /// Fetches one server's view.
    pub async fn get_server(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        Ok(self.view_of(&entry).await)
    }

    /// Persists the operator's preferred server ordering.
    pub async fn set_server_order(&self, server_ids: Vec<String>) -> GarconResult<()> {
        let path = self.settings.config_dir().join(SERVER_ORDER_FILENAME);
        self.store.write_json(&path, &server_ids).await
    }

    pub(super) async fn load_order(&self) -> Vec<String> {
        let path = self.settings.config_dir().join(SERVER_ORDER_FILENAME);
        if !self.store.exists(&path).await {
            return Vec::new();
        }
        match self.store.read_json(&path).await {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("ignoring unreadable server order document: {}", e);
                Vec::new()
            }
        }
    }

    /// Looks up a server entry.
    pub(super) async fn entry(&self, server_id: &str) -> GarconResult<Arc<ServerEntry>> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| {
                GarconError::not_found(format!("server '{}' does not exist", server_id))
            })
    }

    /// Resolves the template and provider for a server.
    pub(super) async fn template_and_provider(
        &self,
        entry: &ServerEntry,
    ) -> GarconResult<(Arc<Template>, Arc<dyn ExecutionProvider>)> {
        let template_id = entry.state.read().await.config.template_id.clone();
        let template = self.templates.get(&template_id)?;
        let provider = self.providers.for_mode(*template.get_mode());
        Ok((template, provider))
    }

    /// Writes the entry's configuration to its sidecar.
    pub(super) async fn persist_sidecar(&self, entry: &ServerEntry) -> GarconResult<()> {
        let config = entry.state.read().await.config.clone();
        let path = self
            .settings
            .server_dir(&config.id)
            .join(SIDECAR_FILENAME);
        self.store.write_yaml(&path, &config).await
    }

    /// Publishes the entry's current status on the bus. Call only after the
    /// persistent side effect of the transition has succeeded.
    pub(super) async fn publish_current(&self, entry: &ServerEntry) {
        let (server_id, status, started_at, update_stage) = {
            let state = entry.state.read().await;
            (
                state.config.id.clone(),
                state.status,
                state.started_at,
                state.config.update_stage,
            )
        };

        let update_stage = update_stage.is_active().then_some(update_stage);
        self.events
            .publish_status(&server_id, status, started_at, update_stage)
            .await;
    }

    pub(super) async fn view_of(&self, entry: &ServerEntry) -> ServerView {
        let template_id = entry.state.read().await.config.template_id.clone();
        let template_name = self
            .templates
            .lookup(&template_id)
            .map(|t| t.get_name().clone());
        entry.view(template_name).await
    }

    /// The event bus this orchestrator publishes on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The execution backends, e.g. for availability probes.
    pub fn providers(&self) -> &ExecutionProviders {
        &self.providers
    }

    /// The backup engine this orchestrator delegates to.
    pub fn backups(&self) -> &Arc<BackupEngine> {
        &self.backups
    }

    /// The settings this orchestrator was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Creates an operator-requested backup of a server.
    ///
    /// The shared data directory must not be mid-write: the server has to be
    /// stopped (or parked in `updating`, which is entered from stopped).
    pub async fn create_backup(
        &self,
        server_id: &str,
        description: Option<String>,
    ) -> GarconResult<crate::backup::BackupRecord> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        let status = entry.state.read().await.status;
        if !matches!(status, ServerStatus::Stopped | ServerStatus::Updating) {
            return Err(GarconError::state(format!(
                "cannot back up server '{}' while it is {}",
                server_id, status
            )));
        }

        self.backups
            .create(server_id, crate::backup::BackupKind::Manual, description)
            .await
    }

    /// Restores a backup over a server's data directory.
    ///
    /// Requires the server stopped with no update in progress, then reloads
    /// the configuration from the restored sidecar.
    pub async fn restore_backup(
        &self,
        server_id: &str,
        timestamp: &chrono::DateTime<chrono::Utc>,
    ) -> GarconResult<crate::backup::RestoreResult> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;
            if state.status != ServerStatus::Stopped {
                return Err(GarconError::state(format!(
                    "cannot restore server '{}' while it is {}",
                    server_id, state.status
                )));
            }
            if state.config.update_stage.is_active() {
                return Err(GarconError::state(format!(
                    "cannot restore server '{}' while an update is in progress",
                    server_id
                )));
            }
        }

        let result = self.backups.restore(server_id, timestamp).await?;

        // The archive carried the sidecar of its era; it is authoritative
        // again now.
        let sidecar = self.settings.server_dir(server_id).join(SIDECAR_FILENAME);
        match self.store.read_yaml::<ServerConfig>(&sidecar).await {
            Ok(config) if config.id == server_id => {
                entry.state.write().await.config = config;
            }
            Ok(config) => {
                tracing::warn!(
                    server_id = %server_id,
                    restored_id = %config.id,
                    "restored sidecar carries a different id; keeping in-memory configuration"
                );
            }
            Err(e) => {
                tracing::warn!(
                    server_id = %server_id,
                    "restored tree has no readable sidecar: {}",
                    e
                );
            }
        }

        self.events
            .publish_update(server_id, crate::events::ServerUpdateAction::Updated)
            .await;

        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_dir", &self.settings.data_dir)
            .finish_non_exhaustive()
    }
}
