//! The three-phase update protocol: initiate, apply, cancel.
//!
//! `apply` is a pure copy of the source tree over the server directory:
//! files removed from the new source survive in place. An operator wanting
//! a clean replace cancels the update, deletes the server and re-imports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    backup::BackupKind,
    config::UpdateStage,
    events::ServerUpdateAction,
    GarconError, GarconResult,
};

use super::{Orchestrator, ServerStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The response to a successful update initiation: where to drop new files
/// and which backup guards the rollback path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInitiated {
    /// The import source path the apply phase will copy from.
    pub source_path: String,

    /// When the pre-update backup was taken.
    pub backup_timestamp: DateTime<Utc>,

    /// Where the pre-update backup lives.
    pub backup_path: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Initiates an update: stops the server if needed, takes the blocking
    /// pre-update backup and parks the server in `updating`.
    pub async fn initiate_update(&self, server_id: &str) -> GarconResult<UpdateInitiated> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;

            if state.config.update_stage.is_active() {
                return Err(GarconError::state(format!(
                    "an update of server '{}' is already in progress",
                    server_id
                )));
            }

            match state.status {
                ServerStatus::Stopped | ServerStatus::Running => {}
                status => {
                    return Err(GarconError::state(format!(
                        "cannot update server '{}' while it is {}",
                        server_id, status
                    )));
                }
            }
        }

        if entry.state.read().await.status == ServerStatus::Running {
            self.stop_locked(&entry, server_id, self.settings.auto_backup_on_stop)
                .await?;
        }

        // Blocking: without this backup there is no rollback path, so a
        // failure aborts the initiation.
        let backup = self
            .backups
            .create(server_id, BackupKind::PreUpdate, None)
            .await?;

        let source_path = {
            let mut state = entry.state.write().await;
            state.config.update_stage = UpdateStage::Initiated;
            state.pre_update_backup = Some(backup.timestamp);
            state.status = ServerStatus::Updating;
            state.config.source_path.clone()
        };
        self.persist_sidecar(&entry).await?;
        self.publish_current(&entry).await;

        tracing::info!(server_id = %server_id, "update initiated");

        Ok(UpdateInitiated {
            source_path,
            backup_timestamp: backup.timestamp,
            backup_path: backup.path.display().to_string(),
        })
    }

    /// Applies an initiated update by copying the source path over the
    /// server directory.
    pub async fn apply_update(&self, server_id: &str) -> GarconResult<()> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;
            if state.config.update_stage != UpdateStage::Initiated {
                return Err(GarconError::state(format!(
                    "no initiated update for server '{}'",
                    server_id
                )));
            }
        }

        {
            let mut state = entry.state.write().await;
            state.config.update_stage = UpdateStage::Applying;
            state.status = ServerStatus::Updating;
        }
        self.persist_sidecar(&entry).await?;
        self.publish_current(&entry).await;

        let source_path = entry.state.read().await.config.source_path.clone();
        let server_dir = self.settings.server_dir(server_id);

        match self.store.copy_dir(&source_path, &server_dir).await {
            Ok(()) => {
                {
                    let mut state = entry.state.write().await;
                    state.config.update_stage = UpdateStage::None;
                    state.config.updated_at = Utc::now();
                    state.pre_update_backup = None;
                    state.status = ServerStatus::Stopped;
                }
                self.persist_sidecar(&entry).await?;
                self.publish_current(&entry).await;
                self.events
                    .publish_update(server_id, ServerUpdateAction::Updated)
                    .await;

                tracing::info!(server_id = %server_id, "update applied");
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = entry.state.write().await;
                    state.config.update_stage = UpdateStage::Initiated;
                    state.status = ServerStatus::Error;
                }
                if let Err(persist_err) = self.persist_sidecar(&entry).await {
                    tracing::warn!(
                        server_id = %server_id,
                        "failed to persist update stage after copy failure: {}",
                        persist_err
                    );
                }
                self.publish_current(&entry).await;

                tracing::error!(server_id = %server_id, "update apply failed: {}", e);
                Err(e)
            }
        }
    }

    /// Cancels an update in progress. The pre-update backup is retained for
    /// a manual restore.
    pub async fn cancel_update(&self, server_id: &str) -> GarconResult<()> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;
            if !state.config.update_stage.is_active() {
                return Err(GarconError::state(format!(
                    "no update of server '{}' to cancel",
                    server_id
                )));
            }
        }

        {
            let mut state = entry.state.write().await;
            state.config.update_stage = UpdateStage::None;
            state.pre_update_backup = None;
            state.status = ServerStatus::Stopped;
        }
        self.persist_sidecar(&entry).await?;
        self.publish_current(&entry).await;

        tracing::info!(server_id = %server_id, "update cancelled");
        Ok(())
    }
}
