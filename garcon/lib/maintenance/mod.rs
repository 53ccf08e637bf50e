//! The daily maintenance routine: every day at 04:00 America/New_York,
//! snapshot and stop every running server, then start the ones whose
//! configuration asks to come back up.
//!
//! A companion task at 00:00 UTC re-arms the maintenance timer so the local
//! wall-clock target tracks 04:00 Eastern across DST transitions.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::orchestration::{Orchestrator, ServerStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maintenance hour, on the Eastern wall clock.
const MAINTENANCE_HOUR: u32 = 4;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives the daily maintenance routine and its re-arm companion.
pub struct MaintenanceScheduler {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    rearm: Arc<Notify>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MaintenanceScheduler {
    /// Creates a scheduler over the given orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            cancel: CancellationToken::new(),
            rearm: Arc::new(Notify::new()),
        }
    }

    /// Spawns the maintenance task and the 00:00 UTC re-arm task.
    pub fn start(&self) {
        let orchestrator = self.orchestrator.clone();
        let cancel = self.cancel.clone();
        let rearm = self.rearm.clone();

        tokio::spawn(async move {
            loop {
                let next = next_maintenance_after(Utc::now());
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tracing::info!("next maintenance at {} (in {:?})", next, wait);

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = rearm.notified() => {
                        tracing::debug!("maintenance timer re-armed");
                        continue;
                    }
                    _ = tokio::time::sleep(wait) => {
                        run_maintenance(&orchestrator).await;
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        let rearm = self.rearm.clone();

        tokio::spawn(async move {
            loop {
                let wait = (next_utc_midnight_after(Utc::now()) - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {
                        // Recompute the DST offset by forcing the
                        // maintenance task to re-derive its target.
                        rearm.notify_one();
                    }
                }
            }
        });
    }

    /// Stops both scheduled tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs one maintenance pass. Failures on a single server are logged and do
/// not abort the loop.
async fn run_maintenance(orchestrator: &Arc<Orchestrator>) {
    tracing::info!("maintenance routine starting");

    for server in orchestrator.list_servers().await {
        if server.status != ServerStatus::Running {
            continue;
        }

        tracing::info!(server_id = %server.id, "maintenance: snapshotting");
        if let Err(e) = orchestrator
            .backups()
            .create(&server.id, crate::backup::BackupKind::Auto, None)
            .await
        {
            tracing::warn!(server_id = %server.id, "maintenance backup failed: {}", e);
            continue;
        }

        // The snapshot above replaces the stop hook's automatic backup.
        if let Err(e) = orchestrator.stop_server_without_backup(&server.id).await {
            tracing::warn!(server_id = %server.id, "maintenance stop failed: {}", e);
            continue;
        }

        if server.restart_after_maintenance {
            if let Err(e) = orchestrator.start_server(&server.id).await {
                tracing::warn!(server_id = %server.id, "maintenance restart failed: {}", e);
            }
        }
    }

    tracing::info!("maintenance routine finished");
}

/// The next 04:00 America/New_York instant strictly after `after`.
///
/// The target is defined on the Eastern wall clock, so the UTC offset moves
/// with the spring and fall DST transitions.
pub fn next_maintenance_after(after: DateTime<Utc>) -> DateTime<Utc> {
    let local = after.with_timezone(&New_York);
    let mut date = local.date_naive();

    loop {
        // 04:00 exists on every Eastern calendar day (transitions happen at
        // 02:00); earliest() covers the ambiguous fall-back hour anyway.
        let candidate = New_York
            .with_ymd_and_hms(date.year(), date.month(), date.day(), MAINTENANCE_HOUR, 0, 0)
            .earliest();

        if let Some(candidate) = candidate {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > after {
                return candidate;
            }
        }

        date += ChronoDuration::days(1);
    }
}

/// The next 00:00 UTC instant strictly after `after`.
pub fn next_utc_midnight_after(after: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = after
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("midnight is a valid time");

    if midnight > after {
        midnight
    } else {
        midnight + ChronoDuration::days(1)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
