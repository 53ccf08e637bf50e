//! Shared state handed to every HTTP handler.

use std::sync::Arc;

use crate::{
    backup::BackupEngine, config::Settings, events::EventBus, orchestration::Orchestrator,
    store::FileStore, templates::TemplateRegistry,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared facade state: the orchestrator and its collaborators.
#[derive(Clone)]
pub struct AppState {
    /// The server orchestrator.
    pub orchestrator: Arc<Orchestrator>,

    /// The template registry.
    pub templates: Arc<TemplateRegistry>,

    /// The backup engine.
    pub backups: Arc<BackupEngine>,

    /// The event bus behind the push channel.
    pub events: Arc<EventBus>,

    /// Process settings.
    pub settings: Settings,

    /// The file store, for the import-folder listing.
    pub store: FileStore,
}
