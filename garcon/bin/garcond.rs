//! The garcon daemon: wires the components together and serves the REST +
//! push API.

use std::sync::Arc;

use garcon::{
    backup::BackupEngine,
    config::Settings,
    events::EventBus,
    maintenance::MaintenanceScheduler,
    orchestration::{ExecutionProviders, Orchestrator},
    runtime::{ContainerProvider, ExecutionProvider, NativeProvider},
    server::{create_router, AppState},
    store::FileStore,
    templates::TemplateRegistry,
    utils::{
        BACKUPS_SUBDIR, LOG_LEVEL_ENV_VAR, LOG_PRETTY_ENV_VAR, NATIVE_RECORDS_FILENAME,
        SERVERS_SUBDIR,
    },
    GarconResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> GarconResult<()> {
    init_tracing();

    let settings = Settings::from_env();
    tracing::info!(
        data_dir = %settings.data_dir.display(),
        "garcond starting"
    );

    let store = FileStore::new();
    for dir in [
        settings.config_dir(),
        settings.templates_dir(),
        settings.servers_dir(),
        settings.logs_dir(),
        settings.import_dir.clone(),
    ] {
        store.ensure_dir(&dir).await?;
    }

    let templates =
        Arc::new(TemplateRegistry::load(&store, settings.templates_dir()).await?);

    let backups = Arc::new(BackupEngine::new(
        store.clone(),
        settings.data_dir.join(BACKUPS_SUBDIR),
        settings.servers_dir(),
        settings.max_backups_per_type,
    ));

    let container: Arc<dyn ExecutionProvider> = Arc::new(ContainerProvider::new(
        settings.host_data_dir.join(SERVERS_SUBDIR),
    )?);
    if !container.check_availability().await {
        // Startup continues: the operator can still inspect configured
        // servers and recover once the daemon is back.
        tracing::warn!("container daemon is not reachable");
    }

    let native: Arc<dyn ExecutionProvider> = Arc::new(NativeProvider::new(
        store.clone(),
        settings.data_dir.join(NATIVE_RECORDS_FILENAME),
        settings.logs_dir(),
        settings.servers_dir(),
    ));

    let events = EventBus::new();

    let orchestrator = Orchestrator::new(
        settings.clone(),
        store.clone(),
        templates.clone(),
        backups.clone(),
        ExecutionProviders { container, native },
        events.clone(),
    );
    orchestrator.initialize().await?;

    let scheduler = MaintenanceScheduler::new(orchestrator.clone());
    scheduler.start();

    let state = AppState {
        orchestrator,
        templates,
        backups,
        events,
        settings: settings.clone(),
        store,
    };

    let listener = tokio::net::TcpListener::bind(settings.bind_addr()).await?;
    tracing::info!("listening on {}", settings.bind_addr());

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            scheduler.shutdown();
        })
        .await?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let pretty = std::env::var(LOG_PRETTY_ENV_VAR)
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(true);

    if pretty {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}
