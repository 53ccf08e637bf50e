//! Lifecycle transitions: start, stop, restart and crash acknowledgement.

use std::time::Duration;

use chrono::Utc;

use crate::{backup::BackupKind, runtime::ExecutionProvider, GarconError, GarconResult};

use super::{Orchestrator, ServerEntry, ServerStatus, ServerView};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Starts a server.
    pub async fn start_server(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        self.start_locked(&entry, server_id).await?;
        Ok(self.view_of(&entry).await)
    }

    /// Stops a server.
    pub async fn stop_server(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        self.stop_locked(&entry, server_id, self.settings.auto_backup_on_stop)
            .await?;
        Ok(self.view_of(&entry).await)
    }

    /// Stops a server without the automatic stop backup. The maintenance
    /// routine uses this after taking its own snapshot.
    pub async fn stop_server_without_backup(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        self.stop_locked(&entry, server_id, false).await?;
        Ok(self.view_of(&entry).await)
    }

    /// Restarts a server. A failure in either half bubbles up and the state
    /// reflects where it stopped.
    pub async fn restart_server(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        self.stop_locked(&entry, server_id, self.settings.auto_backup_on_stop)
            .await?;
        self.start_locked(&entry, server_id).await?;
        Ok(self.view_of(&entry).await)
    }

    /// Clears an `error` state after the operator has taken note. Removes
    /// the retained backend artefact.
    pub async fn acknowledge_crash(&self, server_id: &str) -> GarconResult<ServerView> {
        let entry = self.entry(server_id).await?;
        let _guard = entry.begin_transition()?;

        {
            let state = entry.state.read().await;
            if state.status != ServerStatus::Error {
                return Err(GarconError::state(format!(
                    "server '{}' is {}, not in error",
                    server_id, state.status
                )));
            }
        }

        let provider = match self.template_and_provider(&entry).await {
            Ok((_, provider)) => provider,
            Err(_) => self.providers.container.clone(),
        };
        provider.remove(server_id).await?;

        {
            let mut state = entry.state.write().await;
            state.status = ServerStatus::Stopped;
            state.started_at = None;
        }
        self.publish_current(&entry).await;

        tracing::info!(server_id = %server_id, "crash acknowledged");
        Ok(self.view_of(&entry).await)
    }

    /// The start transition body; the caller holds the transition lock.
    pub(super) async fn start_locked(
        &self,
        entry: &ServerEntry,
        server_id: &str,
    ) -> GarconResult<()> {
        {
            let state = entry.state.read().await;

            if state.status != ServerStatus::Stopped {
                return Err(GarconError::state(format!(
                    "cannot start server '{}' while it is {}",
                    server_id, state.status
                )));
            }

            if state.config.update_stage.is_active() {
                return Err(GarconError::state(format!(
                    "cannot start server '{}' while an update is in progress",
                    server_id
                )));
            }
        }

        let (template, provider) = self.template_and_provider(entry).await?;
        let config = entry.state.read().await.config.clone();
        let data_path = self.settings.server_dir(server_id);

        entry.state.write().await.status = ServerStatus::Starting;
        self.publish_current(entry).await;

        match provider.start(&config, &template, &data_path).await {
            Ok(instance_id) => {
                {
                    let mut state = entry.state.write().await;
                    state.status = ServerStatus::Running;
                    state.started_at = Some(Utc::now());
                }
                self.publish_current(entry).await;

                tracing::info!(
                    server_id = %server_id,
                    instance = %instance_id,
                    "server started"
                );
                Ok(())
            }
            Err(e) => {
                entry.state.write().await.status = ServerStatus::Error;
                self.publish_current(entry).await;

                tracing::error!(server_id = %server_id, "start failed: {}", e);
                Err(e)
            }
        }
    }

    /// The stop transition body; the caller holds the transition lock.
    pub(super) async fn stop_locked(
        &self,
        entry: &ServerEntry,
        server_id: &str,
        auto_backup: bool,
    ) -> GarconResult<()> {
        {
            let state = entry.state.read().await;
            if state.status != ServerStatus::Running {
                return Err(GarconError::state(format!(
                    "cannot stop server '{}' while it is {}",
                    server_id, state.status
                )));
            }
        }

        let (template, provider) = self.template_and_provider(entry).await?;

        entry.state.write().await.status = ServerStatus::Stopping;
        self.publish_current(entry).await;

        if auto_backup {
            if let Err(e) = self
                .backups
                .create(server_id, BackupKind::Auto, None)
                .await
            {
                // The stop is aborted: a failed snapshot means the data
                // directory may not be safe to touch.
                entry.state.write().await.status = ServerStatus::Error;
                self.publish_current(entry).await;

                tracing::error!(server_id = %server_id, "stop aborted, auto backup failed: {}", e);
                return Err(e);
            }
        }

        let timeout = Duration::from_secs(template.stop_timeout_secs());
        match provider.stop(server_id, &template, Some(timeout)).await {
            Ok(()) => {
                {
                    let mut state = entry.state.write().await;
                    state.status = ServerStatus::Stopped;
                    state.started_at = None;
                }
                self.publish_current(entry).await;

                tracing::info!(server_id = %server_id, "server stopped");
                Ok(())
            }
            Err(e) => {
                entry.state.write().await.status = ServerStatus::Error;
                self.publish_current(entry).await;

                tracing::error!(server_id = %server_id, "stop failed: {}", e);
                Err(e)
            }
        }
    }
}
