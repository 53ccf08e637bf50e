//! Backup creation, listing, deletion, restore and retention.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::Serialize;
use tokio::task;

use crate::{store::FileStore, GarconError, GarconResult};

use super::{backup_filename, parse_backup_filename, BackupKind, BackupRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, lists, deletes and restores compressed archives of server data
/// directories.
#[derive(Debug)]
pub struct BackupEngine {
    store: FileStore,

    /// Root of the backup tree; archives live at `<root>/<server_id>/`.
    backups_root: PathBuf,

    /// Root of the managed server directories.
    servers_dir: PathBuf,

    /// Per-server, per-type retention cap.
    max_per_kind: usize,
}

/// The outcome of a restore.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    /// The restored server.
    pub server_id: String,

    /// The timestamp of the archive that was restored.
    pub restored_from: DateTime<Utc>,

    /// The safety backup taken before the data directory was replaced.
    pub pre_restore_backup: BackupRecord,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackupEngine {
    /// Creates a backup engine.
    pub fn new(
        store: FileStore,
        backups_root: PathBuf,
        servers_dir: PathBuf,
        max_per_kind: usize,
    ) -> Self {
        Self {
            store,
            backups_root,
            servers_dir,
            max_per_kind,
        }
    }

    /// The backup directory for a server.
    pub fn backup_dir(&self, server_id: &str) -> PathBuf {
        self.backups_root.join(server_id)
    }

    /// Creates a backup of the server's data directory.
    ///
    /// The timestamp is taken after the existence precondition, in UTC at
    /// millisecond precision. The archive streams through a temporary file
    /// and is renamed into place on success; retention is enforced before
    /// returning. The description is transient metadata echoed in the
    /// returned record only.
    pub async fn create(
        &self,
        server_id: &str,
        kind: BackupKind,
        description: Option<String>,
    ) -> GarconResult<BackupRecord> {
        let data_dir = self.servers_dir.join(server_id);
        if !self.store.is_dir(&data_dir).await {
            return Err(GarconError::not_found(format!(
                "server directory for '{}' does not exist",
                server_id
            )));
        }

        let backup_dir = self.backup_dir(server_id);
        self.store.ensure_dir(&backup_dir).await?;

        let timestamp = Utc::now();
        let file_name = backup_filename(&timestamp, kind);
        let path = backup_dir.join(&file_name);

        let archive_src = data_dir.clone();
        let archive_dst = path.clone();
        task::spawn_blocking(move || write_archive(&archive_src, &archive_dst))
            .await
            .map_err(GarconError::custom)??;

        let size = tokio::fs::metadata(&path).await?.len();

        // Best-effort: a retention failure never fails the create that
        // triggered it.
        if let Err(e) = self.enforce_retention(server_id, kind).await {
            tracing::warn!(server_id = %server_id, "backup retention failed: {}", e);
        }

        tracing::info!(
            server_id = %server_id,
            kind = %kind,
            file = %file_name,
            size = size,
            "backup created"
        );

        Ok(BackupRecord {
            server_id: server_id.to_string(),
            timestamp,
            kind,
            size,
            description,
            file_name,
            path,
        })
    }

    /// Lists a server's backups, newest first. Filenames outside the
    /// grammar and a missing backup directory yield no entries.
    pub async fn list(&self, server_id: &str) -> GarconResult<Vec<BackupRecord>> {
        let backup_dir = self.backup_dir(server_id);
        let mut records = Vec::new();

        for path in self.store.list_files(&backup_dir, None).await? {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            let Some((timestamp, kind)) = parse_backup_filename(&file_name) else {
                continue;
            };

            let size = tokio::fs::metadata(&path).await?.len();

            records.push(BackupRecord {
                server_id: server_id.to_string(),
                timestamp,
                kind,
                size,
                description: None,
                file_name,
                path,
            });
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Deletes the single backup matching the timestamp.
    pub async fn delete(&self, server_id: &str, timestamp: &DateTime<Utc>) -> GarconResult<()> {
        let record = self
            .find(server_id, timestamp)
            .await?
            .ok_or_else(|| {
                GarconError::not_found(format!(
                    "no backup of '{}' at {}",
                    server_id, timestamp
                ))
            })?;

        self.store.remove_file(&record.path).await?;
        tracing::info!(server_id = %server_id, file = %record.file_name, "backup deleted");

        Ok(())
    }

    /// Removes a server's entire backup directory, if present.
    pub async fn delete_all(&self, server_id: &str) -> GarconResult<()> {
        self.store.remove_dir(self.backup_dir(server_id)).await
    }

    /// Finds a backup by exact parsed-timestamp equality.
    pub async fn find(
        &self,
        server_id: &str,
        timestamp: &DateTime<Utc>,
    ) -> GarconResult<Option<BackupRecord>> {
        let records = self.list(server_id).await?;
        Ok(records.into_iter().find(|r| &r.timestamp == timestamp))
    }

    /// Restores a backup over the server's data directory.
    ///
    /// A pre-restore backup of the current directory is taken first; the
    /// directory is then deleted and the archive extracted into a fresh one.
    /// If extraction fails the pre-restore backup is retained and the error
    /// surfaced.
    pub async fn restore(
        &self,
        server_id: &str,
        timestamp: &DateTime<Utc>,
    ) -> GarconResult<RestoreResult> {
        let record = self
            .find(server_id, timestamp)
            .await?
            .ok_or_else(|| {
                GarconError::not_found(format!(
                    "no backup of '{}' at {}",
                    server_id, timestamp
                ))
            })?;

        let pre_restore_backup = self.create(server_id, BackupKind::PreRestore, None).await?;

        let data_dir = self.servers_dir.join(server_id);
        self.store.remove_dir(&data_dir).await?;
        self.store.ensure_dir(&data_dir).await?;

        let archive = record.path.clone();
        let extract_dst = data_dir.clone();
        task::spawn_blocking(move || extract_archive(&archive, &extract_dst))
            .await
            .map_err(GarconError::custom)??;

        tracing::info!(
            server_id = %server_id,
            file = %record.file_name,
            "backup restored"
        );

        Ok(RestoreResult {
            server_id: server_id.to_string(),
            restored_from: record.timestamp,
            pre_restore_backup,
        })
    }

    /// Deletes the oldest backups of a kind beyond the retention cap.
    async fn enforce_retention(&self, server_id: &str, kind: BackupKind) -> GarconResult<()> {
        let records = self.list(server_id).await?;
        let of_kind: Vec<_> = records.into_iter().filter(|r| r.kind == kind).collect();

        // The list is newest-first; everything past the cap is excess.
        for record in of_kind.iter().skip(self.max_per_kind) {
            tracing::info!(
                server_id = %server_id,
                file = %record.file_name,
                "removing backup beyond retention cap"
            );
            self.store.remove_file(&record.path).await?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn write_archive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let tmp = dst.with_extension("tmp");

    let file = std::fs::File::create(&tmp)?;
    let encoder = GzEncoder::new(file, Compression::new(6));
    let mut builder = tar::Builder::new(encoder);

    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;

    std::fs::rename(&tmp, dst)?;
    Ok(())
}

fn extract_archive(archive: &Path, dst: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut extractor = tar::Archive::new(decoder);
    extractor.unpack(dst)?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with_server(max_per_kind: usize) -> (tempfile::TempDir, BackupEngine, String) {
        let dir = tempfile::tempdir().unwrap();
        let servers_dir = dir.path().join("servers");
        let backups_root = dir.path().join("backups");

        let server_id = "alpha-0011223344".to_string();
        tokio::fs::create_dir_all(servers_dir.join(&server_id).join("world"))
            .await
            .unwrap();
        tokio::fs::write(
            servers_dir.join(&server_id).join("server.jar"),
            b"jar bytes",
        )
        .await
        .unwrap();
        tokio::fs::write(
            servers_dir.join(&server_id).join("world/level.dat"),
            b"level",
        )
        .await
        .unwrap();

        let engine = BackupEngine::new(FileStore::new(), backups_root, servers_dir, max_per_kind);

        (dir, engine, server_id)
    }

    #[tokio::test]
    async fn test_create_and_list() -> anyhow::Result<()> {
        let (_dir, engine, server_id) = engine_with_server(5).await;

        let record = engine
            .create(&server_id, BackupKind::Manual, Some("before mods".to_string()))
            .await?;
        assert!(record.size > 0);
        assert_eq!(record.description.as_deref(), Some("before mods"));
        assert!(record.file_name.starts_with("backup-"));
        assert!(record.file_name.ends_with("-manual.tar.gz"));

        let listed = engine.list(&server_id).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].timestamp, record.timestamp);
        // Descriptions are transient; listings never carry them.
        assert!(listed[0].description.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_create_missing_server_is_not_found() {
        let (_dir, engine, _) = engine_with_server(5).await;

        let result = engine.create("ghost-0011223344", BackupKind::Manual, None).await;
        assert!(matches!(result, Err(GarconError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_listing_ignores_foreign_files() -> anyhow::Result<()> {
        let (_dir, engine, server_id) = engine_with_server(5).await;

        engine.create(&server_id, BackupKind::Manual, None).await?;
        tokio::fs::write(
            engine.backup_dir(&server_id).join("notes.txt"),
            b"operator notes",
        )
        .await?;

        assert_eq!(engine.list(&server_id).await?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_retention_cap() -> anyhow::Result<()> {
        let (_dir, engine, server_id) = engine_with_server(3).await;

        let mut timestamps = Vec::new();
        for _ in 0..5 {
            let record = engine.create(&server_id, BackupKind::Manual, None).await?;
            timestamps.push(record.timestamp);
            // Millisecond-precision timestamps must differ between creates.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            let count = engine.list(&server_id).await?.len();
            assert!(count <= 3, "retention cap exceeded: {}", count);
        }

        let retained: Vec<_> = engine
            .list(&server_id)
            .await?
            .into_iter()
            .map(|r| r.timestamp)
            .collect();

        // Newest-first listing of the three most recent creates.
        assert_eq!(
            retained,
            vec![timestamps[4], timestamps[3], timestamps[2]]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_retention_is_per_kind() -> anyhow::Result<()> {
        let (_dir, engine, server_id) = engine_with_server(1).await;

        engine.create(&server_id, BackupKind::Manual, None).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.create(&server_id, BackupKind::Auto, None).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.create(&server_id, BackupKind::PreUpdate, None).await?;

        let listed = engine.list(&server_id).await?;
        assert_eq!(listed.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_by_timestamp() -> anyhow::Result<()> {
        let (_dir, engine, server_id) = engine_with_server(5).await;

        let record = engine.create(&server_id, BackupKind::Manual, None).await?;
        engine.delete(&server_id, &record.timestamp).await?;
        assert!(engine.list(&server_id).await?.is_empty());

        let missing = engine.delete(&server_id, &record.timestamp).await;
        assert!(matches!(missing, Err(GarconError::NotFound(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_restore_round_trip() -> anyhow::Result<()> {
        let (dir, engine, server_id) = engine_with_server(5).await;
        let data_dir = dir.path().join("servers").join(&server_id);

        let record = engine.create(&server_id, BackupKind::Manual, None).await?;

        // Mutate the live tree after the backup.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        tokio::fs::write(data_dir.join("server.jar"), b"corrupted").await?;
        tokio::fs::write(data_dir.join("extra.txt"), b"junk").await?;

        let result = engine.restore(&server_id, &record.timestamp).await?;
        assert_eq!(result.restored_from, record.timestamp);
        assert_eq!(result.pre_restore_backup.kind, BackupKind::PreRestore);
        assert!(result.pre_restore_backup.timestamp > record.timestamp);

        // The data directory is the archived tree again.
        assert_eq!(
            tokio::fs::read(data_dir.join("server.jar")).await?,
            b"jar bytes"
        );
        assert_eq!(
            tokio::fs::read(data_dir.join("world/level.dat")).await?,
            b"level"
        );
        assert!(!tokio::fs::try_exists(data_dir.join("extra.txt")).await?);

        // Exactly one pre-restore backup exists alongside the original.
        let listed = engine.list(&server_id).await?;
        let pre_restore: Vec<_> = listed
            .iter()
            .filter(|r| r.kind == BackupKind::PreRestore)
            .collect();
        assert_eq!(pre_restore.len(), 1);

        Ok(())
    }
}
