//! The backup engine: compressed archives of server data directories with
//! per-type retention and filename-encoded metadata.

mod engine;
mod filename;

use std::{path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GarconError;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use engine::*;
pub use filename::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    /// Requested explicitly by the operator.
    Manual,

    /// Taken automatically (stop hook, maintenance routine).
    Auto,

    /// Safety copy taken when an update is initiated.
    PreUpdate,

    /// Safety copy taken before a restore replaces the data directory.
    PreRestore,
}

/// A backup archive, derived from its filename and size on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// The owning server id.
    pub server_id: String,

    /// When the backup was taken (UTC, millisecond precision).
    pub timestamp: DateTime<Utc>,

    /// Why the backup was taken.
    pub kind: BackupKind,

    /// Archive size in bytes.
    pub size: u64,

    /// Transient description supplied at creation; not stored on disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The on-disk filename.
    pub file_name: String,

    /// The absolute path of the archive.
    pub path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackupKind {
    /// The filename form of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Auto => "auto",
            BackupKind::PreUpdate => "pre-update",
            BackupKind::PreRestore => "pre-restore",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for BackupKind {
    type Err = GarconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BackupKind::Manual),
            "auto" => Ok(BackupKind::Auto),
            "pre-update" => Ok(BackupKind::PreUpdate),
            "pre-restore" => Ok(BackupKind::PreRestore),
            other => Err(GarconError::validation(format!(
                "unknown backup type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
