//! End-to-end orchestrator scenarios driven against the scriptable mock
//! execution provider.

use std::{sync::Arc, time::Duration};

use garcon::{
    backup::{format_timestamp, sanitize_timestamp, BackupEngine, BackupKind},
    config::{ServerConfig, Settings, UpdateStage},
    events::{EventBus, InboundMessage, OutboundMessage, ServerUpdateAction, SubscriberId},
    orchestration::{
        ExecutionProviders, ImportServerRequest, Orchestrator, ServerStatus, ServerView,
    },
    runtime::{ExecutionProvider, MockProvider},
    store::FileStore,
    templates::TemplateRegistry,
    GarconError,
};
use tokio::sync::mpsc::UnboundedReceiver;

//--------------------------------------------------------------------------------------------------
// Harness
//--------------------------------------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    settings: Settings,
    store: FileStore,
    orchestrator: Arc<Orchestrator>,
    provider: Arc<MockProvider>,
    events: Arc<EventBus>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_auto_backup(true).await
    }

    async fn with_auto_backup(auto_backup_on_stop: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let settings = Settings {
            data_dir: dir.path().join("data"),
            host_data_dir: dir.path().join("data"),
            import_dir: dir.path().join("import"),
            host_import_dir: dir.path().join("import"),
            auto_backup_on_stop,
            ..Settings::default()
        };

        let store = FileStore::new();
        store.ensure_dir(settings.servers_dir()).await.unwrap();

        let templates = Arc::new(
            TemplateRegistry::load(&store, settings.templates_dir())
                .await
                .unwrap(),
        );

        let backups = Arc::new(BackupEngine::new(
            store.clone(),
            settings.data_dir.join("backups"),
            settings.servers_dir(),
            settings.max_backups_per_type,
        ));

        let provider = MockProvider::new();
        let providers = ExecutionProviders {
            container: provider.clone(),
            native: provider.clone(),
        };

        let events = EventBus::new();
        let orchestrator = Orchestrator::new(
            settings.clone(),
            store.clone(),
            templates,
            backups,
            providers,
            events.clone(),
        );
        orchestrator.initialize().await.unwrap();

        Self {
            _dir: dir,
            settings,
            store,
            orchestrator,
            provider,
            events,
        }
    }

    /// Creates an import source directory satisfying the minecraft template.
    async fn make_source(&self, name: &str) -> String {
        let source = self.settings.import_dir.join(name);
        tokio::fs::create_dir_all(source.join("world")).await.unwrap();
        tokio::fs::write(source.join("server.jar"), b"jar bytes")
            .await
            .unwrap();
        tokio::fs::write(source.join("world/level.dat"), b"level")
            .await
            .unwrap();
        source.display().to_string()
    }

    async fn import(&self, name: &str) -> ServerView {
        let source_path = self.make_source(&format!("src-{}", name.to_lowercase())).await;
        self.orchestrator
            .import_server(ImportServerRequest {
                name: name.to_string(),
                template_id: "minecraft".to_string(),
                source_path,
                ports: None,
                environment: Default::default(),
                memory_limit: None,
                cpu_limit: None,
            })
            .await
            .unwrap()
    }

    /// Subscribes to every event on the bus.
    async fn subscribe_all(&self) -> (SubscriberId, UnboundedReceiver<OutboundMessage>) {
        let (id, rx) = self.events.register().await;
        self.events
            .handle_inbound(id, InboundMessage::Subscribe { server_id: None })
            .await;
        (id, rx)
    }

    async fn sidecar(&self, server_id: &str) -> ServerConfig {
        self.store
            .read_yaml(self.settings.server_dir(server_id).join(".garcon.yaml"))
            .await
            .unwrap()
    }

    /// Waits until the server reaches the status, for transitions driven by
    /// spawned tasks (crash handling).
    async fn await_status(&self, server_id: &str, status: ServerStatus) {
        for _ in 0..200 {
            let view = self.orchestrator.get_server(server_id).await.unwrap();
            if view.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never reached {:?}", status);
    }
}

fn drain(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn statuses(messages: &[OutboundMessage]) -> Vec<ServerStatus> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::ServerStatus { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_import_start_stop() {
    let harness = Harness::new().await;
    let (_, mut rx) = harness.subscribe_all().await;

    // Import.
    let view = harness.import("Alpha").await;
    assert!(is_generated_alpha_id(&view.id), "unexpected server id {}", view.id);
    assert_eq!(view.status, ServerStatus::Stopped);
    assert_eq!(view.update_stage, UpdateStage::None);
    // Default ports map host == container from the template.
    assert!(view.ports.iter().any(|p| p.host_port == 25565 && p.container_port == 25565));

    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboundMessage::ServerUpdate { action: ServerUpdateAction::Created, .. }
    )));

    // The data directory holds the copied source plus the sidecar.
    let data_dir = harness.settings.server_dir(&view.id);
    assert!(tokio::fs::try_exists(data_dir.join("server.jar")).await.unwrap());
    let sidecar = harness.sidecar(&view.id).await;
    assert_eq!(sidecar.id, view.id);

    // Start.
    let started = harness.orchestrator.start_server(&view.id).await.unwrap();
    assert_eq!(started.status, ServerStatus::Running);
    assert!(started.started_at.is_some());
    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ServerStatus::Starting, ServerStatus::Running]
    );

    // Stop.
    let stopped = harness.orchestrator.stop_server(&view.id).await.unwrap();
    assert_eq!(stopped.status, ServerStatus::Stopped);
    assert!(stopped.started_at.is_none());
    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ServerStatus::Stopping, ServerStatus::Stopped]
    );

    // The stop hook snapshotted once.
    let backups = harness.orchestrator.backups().list(&view.id).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].kind, BackupKind::Auto);
}

/// `slug(name)-<40-bit-hex>` for the name "Alpha".
fn is_generated_alpha_id(id: &str) -> bool {
    match id.strip_prefix("alpha-") {
        Some(suffix) => suffix.len() == 10 && suffix.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

#[tokio::test]
async fn test_crash_and_acknowledge() {
    let harness = Harness::new().await;
    let view = harness.import("Alpha").await;
    harness.orchestrator.start_server(&view.id).await.unwrap();

    let (_, mut rx) = harness.subscribe_all().await;

    // The backend reports an unexpected exit.
    harness.provider.emit_exit(&view.id, Some(137)).await;
    harness.await_status(&view.id, ServerStatus::Error).await;

    let messages = drain(&mut rx);
    assert_eq!(statuses(&messages), vec![ServerStatus::Error]);

    // The artefact is retained for inspection until acknowledged.
    let status = harness.provider.get_process_status(&view.id).await.unwrap();
    assert!(status.exists);
    assert!(!status.running);

    // Lifecycle operations are rejected from error.
    assert!(matches!(
        harness.orchestrator.start_server(&view.id).await,
        Err(GarconError::State(_))
    ));
    assert!(matches!(
        harness.orchestrator.stop_server(&view.id).await,
        Err(GarconError::State(_))
    ));

    // Acknowledge clears the state and removes the artefact.
    let view_after = harness.orchestrator.acknowledge_crash(&view.id).await.unwrap();
    assert_eq!(view_after.status, ServerStatus::Stopped);

    let status = harness.provider.get_process_status(&view.id).await.unwrap();
    assert!(!status.exists);
}

#[tokio::test]
async fn test_exit_during_stopping_is_ignored() {
    let harness = Harness::with_auto_backup(false).await;
    let view = harness.import("Alpha").await;
    harness.orchestrator.start_server(&view.id).await.unwrap();
    harness.orchestrator.stop_server(&view.id).await.unwrap();

    // A late exit notification for an already-stopped server changes
    // nothing.
    harness.provider.emit_exit(&view.id, Some(0)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = harness.orchestrator.get_server(&view.id).await.unwrap();
    assert_eq!(after.status, ServerStatus::Stopped);
}

#[tokio::test]
async fn test_update_happy_path() {
    let harness = Harness::new().await;
    let (_, mut rx) = harness.subscribe_all().await;
    let view = harness.import("Alpha").await;
    drain(&mut rx);

    // Initiate: pre-update backup on disk, stage persisted, status updating.
    let initiated = harness.orchestrator.initiate_update(&view.id).await.unwrap();
    assert_eq!(initiated.source_path, view.source_path);

    let backup_file = format!(
        "backup-{}-pre-update.tar.gz",
        sanitize_timestamp(&format_timestamp(&initiated.backup_timestamp))
    );
    let backup_path = harness
        .settings
        .data_dir
        .join("backups")
        .join(&view.id)
        .join(&backup_file);
    assert!(tokio::fs::try_exists(&backup_path).await.unwrap());

    assert_eq!(harness.sidecar(&view.id).await.update_stage, UpdateStage::Initiated);

    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboundMessage::ServerStatus {
            status: ServerStatus::Updating,
            update_stage: Some(UpdateStage::Initiated),
            ..
        }
    )));

    // The operator drops new files at the source path.
    tokio::fs::write(
        std::path::Path::new(&view.source_path).join("server.jar"),
        b"new jar",
    )
    .await
    .unwrap();

    // Apply: files copied, stage cleared, both events published.
    harness.orchestrator.apply_update(&view.id).await.unwrap();

    let sidecar = harness.sidecar(&view.id).await;
    assert_eq!(sidecar.update_stage, UpdateStage::None);

    let data_dir = harness.settings.server_dir(&view.id);
    assert_eq!(
        tokio::fs::read(data_dir.join("server.jar")).await.unwrap(),
        b"new jar"
    );

    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboundMessage::ServerStatus { status: ServerStatus::Stopped, update_stage: None, .. }
    )));
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboundMessage::ServerUpdate { action: ServerUpdateAction::Updated, .. }
    )));

    let after = harness.orchestrator.get_server(&view.id).await.unwrap();
    assert_eq!(after.status, ServerStatus::Stopped);
    assert!(after.updated_at > view.updated_at);
}

#[tokio::test]
async fn test_update_initiate_from_running_stops_first() {
    let harness = Harness::with_auto_backup(false).await;
    let view = harness.import("Alpha").await;
    harness.orchestrator.start_server(&view.id).await.unwrap();

    harness.orchestrator.initiate_update(&view.id).await.unwrap();

    let after = harness.orchestrator.get_server(&view.id).await.unwrap();
    assert_eq!(after.status, ServerStatus::Updating);

    // The instance was stopped before the backup was taken.
    let operations = harness.provider.operations().await;
    assert!(operations.contains(&format!("stop:{}", view.id)));
}

#[tokio::test]
async fn test_update_cancel_retains_backup() {
    let harness = Harness::new().await;
    let view = harness.import("Alpha").await;

    let initiated = harness.orchestrator.initiate_update(&view.id).await.unwrap();
    harness.orchestrator.cancel_update(&view.id).await.unwrap();

    let sidecar = harness.sidecar(&view.id).await;
    assert_eq!(sidecar.update_stage, UpdateStage::None);

    let after = harness.orchestrator.get_server(&view.id).await.unwrap();
    assert_eq!(after.status, ServerStatus::Stopped);

    // The pre-update backup stays on disk for a manual restore.
    let backups = harness.orchestrator.backups().list(&view.id).await.unwrap();
    assert!(backups
        .iter()
        .any(|b| b.kind == BackupKind::PreUpdate && b.timestamp == initiated.backup_timestamp));
}

#[tokio::test]
async fn test_start_rejected_while_update_in_progress() {
    let harness = Harness::new().await;
    let view = harness.import("Alpha").await;

    harness.orchestrator.initiate_update(&view.id).await.unwrap();

    assert!(matches!(
        harness.orchestrator.start_server(&view.id).await,
        Err(GarconError::State(_))
    ));
    assert!(matches!(
        harness.orchestrator.delete_server(&view.id).await,
        Err(GarconError::State(_))
    ));
    assert!(matches!(
        harness
            .orchestrator
            .restore_backup(&view.id, &chrono::Utc::now())
            .await,
        Err(GarconError::State(_))
    ));
}

#[tokio::test]
async fn test_delete_preserves_backups() {
    let harness = Harness::new().await;
    let view = harness.import("Alpha").await;

    harness.orchestrator.create_backup(&view.id, None).await.unwrap();
    let before = harness.orchestrator.backups().list(&view.id).await.unwrap();
    assert_eq!(before.len(), 1);

    harness.orchestrator.delete_server(&view.id).await.unwrap();

    assert!(matches!(
        harness.orchestrator.get_server(&view.id).await,
        Err(GarconError::NotFound(_))
    ));
    assert!(!harness
        .store
        .exists(harness.settings.server_dir(&view.id))
        .await);

    let after = harness.orchestrator.backups().list(&view.id).await.unwrap();
    assert_eq!(
        before.iter().map(|b| b.timestamp).collect::<Vec<_>>(),
        after.iter().map(|b| b.timestamp).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_delete_rejected_while_running() {
    let harness = Harness::with_auto_backup(false).await;
    let view = harness.import("Alpha").await;
    harness.orchestrator.start_server(&view.id).await.unwrap();

    assert!(matches!(
        harness.orchestrator.delete_server(&view.id).await,
        Err(GarconError::State(_))
    ));
}

#[tokio::test]
async fn test_import_validations() {
    let harness = Harness::new().await;

    // Unknown template.
    let result = harness
        .orchestrator
        .import_server(ImportServerRequest {
            name: "Alpha".to_string(),
            template_id: "doom".to_string(),
            source_path: harness.make_source("src-doom").await,
            ports: None,
            environment: Default::default(),
            memory_limit: None,
            cpu_limit: None,
        })
        .await;
    assert!(matches!(result, Err(GarconError::NotFound(_))));

    // Missing source directory.
    let result = harness
        .orchestrator
        .import_server(ImportServerRequest {
            name: "Alpha".to_string(),
            template_id: "minecraft".to_string(),
            source_path: "/definitely/not/here".to_string(),
            ports: None,
            environment: Default::default(),
            memory_limit: None,
            cpu_limit: None,
        })
        .await;
    assert!(matches!(result, Err(GarconError::Validation(_))));

    // Required file absent.
    let empty = harness.settings.import_dir.join("empty");
    tokio::fs::create_dir_all(&empty).await.unwrap();
    let result = harness
        .orchestrator
        .import_server(ImportServerRequest {
            name: "Alpha".to_string(),
            template_id: "minecraft".to_string(),
            source_path: empty.display().to_string(),
            ports: None,
            environment: Default::default(),
            memory_limit: None,
            cpu_limit: None,
        })
        .await;
    assert!(matches!(result, Err(GarconError::Validation(_))));
}

#[tokio::test]
async fn test_failed_start_lands_in_error() {
    let harness = Harness::new().await;
    let (_, mut rx) = harness.subscribe_all().await;
    let view = harness.import("Alpha").await;
    drain(&mut rx);

    harness.provider.fail_next_start(&view.id).await;
    assert!(harness.orchestrator.start_server(&view.id).await.is_err());

    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ServerStatus::Starting, ServerStatus::Error]
    );
}

#[tokio::test]
async fn test_failed_auto_backup_aborts_stop() {
    let harness = Harness::new().await;
    let view = harness.import("Alpha").await;
    harness.orchestrator.start_server(&view.id).await.unwrap();

    // Remove the data directory behind the engine's back so the snapshot
    // fails; the stop must abort in error.
    harness
        .store
        .remove_dir(harness.settings.server_dir(&view.id))
        .await
        .unwrap();

    assert!(harness.orchestrator.stop_server(&view.id).await.is_err());

    let after = harness.orchestrator.get_server(&view.id).await.unwrap();
    assert_eq!(after.status, ServerStatus::Error);

    // The backend was never asked to stop.
    let operations = harness.provider.operations().await;
    assert!(!operations.contains(&format!("stop:{}", view.id)));
}

#[tokio::test]
async fn test_restore_requires_stopped() {
    let harness = Harness::with_auto_backup(false).await;
    let view = harness.import("Alpha").await;

    let record = harness.orchestrator.create_backup(&view.id, None).await.unwrap();

    harness.orchestrator.start_server(&view.id).await.unwrap();
    assert!(matches!(
        harness.orchestrator.restore_backup(&view.id, &record.timestamp).await,
        Err(GarconError::State(_))
    ));

    harness.orchestrator.stop_server(&view.id).await.unwrap();
    let result = harness
        .orchestrator
        .restore_backup(&view.id, &record.timestamp)
        .await
        .unwrap();
    assert_eq!(result.restored_from, record.timestamp);
    assert_eq!(result.pre_restore_backup.kind, BackupKind::PreRestore);
}

#[tokio::test]
async fn test_reconciliation_from_sidecars() {
    let harness = Harness::with_auto_backup(false).await;

    // Three servers on disk: one whose instance is alive, one mid-update,
    // one plainly stopped.
    let running = harness.import("Runner").await;
    let updating = harness.import("Updater").await;
    let stopped = harness.import("Idler").await;

    harness.orchestrator.start_server(&running.id).await.unwrap();
    harness.orchestrator.initiate_update(&updating.id).await.unwrap();

    // A directory without a sidecar is skipped.
    harness
        .store
        .ensure_dir(harness.settings.servers_dir().join("not-a-server"))
        .await
        .unwrap();

    // A fresh orchestrator over the same tree and backend.
    let events = EventBus::new();
    let templates = Arc::new(
        TemplateRegistry::load(&harness.store, harness.settings.templates_dir())
            .await
            .unwrap(),
    );
    let backups = Arc::new(BackupEngine::new(
        harness.store.clone(),
        harness.settings.data_dir.join("backups"),
        harness.settings.servers_dir(),
        harness.settings.max_backups_per_type,
    ));
    let fresh = Orchestrator::new(
        harness.settings.clone(),
        harness.store.clone(),
        templates,
        backups,
        ExecutionProviders {
            container: harness.provider.clone(),
            native: harness.provider.clone(),
        },
        events,
    );
    fresh.initialize().await.unwrap();

    let views = fresh.list_servers().await;
    assert_eq!(views.len(), 3);

    let status_of = |id: &str| {
        views
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.status)
            .unwrap()
    };
    assert_eq!(status_of(&running.id), ServerStatus::Running);
    assert_eq!(status_of(&updating.id), ServerStatus::Updating);
    assert_eq!(status_of(&stopped.id), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_server_ordering() {
    let harness = Harness::new().await;

    let alpha = harness.import("Alpha").await;
    let bravo = harness.import("Bravo").await;
    let charlie = harness.import("Charlie").await;

    harness
        .orchestrator
        .set_server_order(vec![charlie.id.clone(), alpha.id.clone()])
        .await
        .unwrap();

    let listed: Vec<String> = harness
        .orchestrator
        .list_servers()
        .await
        .into_iter()
        .map(|v| v.id)
        .collect();

    // Explicitly ordered first, the rest by creation time.
    assert_eq!(listed, vec![charlie.id, alpha.id, bravo.id]);
}
