use std::path::PathBuf;

use crate::utils::{
    AUTO_BACKUP_ENV_VAR, BACKUPS_SUBDIR, CONFIG_SUBDIR, DATA_DIR_ENV_VAR, HOST_DATA_DIR_ENV_VAR,
    HOST_ENV_VAR, HOST_IMPORT_DIR_ENV_VAR, IMPORT_DIR_ENV_VAR, LOGS_SUBDIR, MAX_BACKUPS_ENV_VAR,
    PORT_ENV_VAR, SERVERS_SUBDIR, TEMPLATES_SUBDIR,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default bind address for the facade.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// The default port for the facade.
pub const DEFAULT_PORT: u16 = 3001;

/// The default data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// The default per-server, per-type backup retention cap.
pub const DEFAULT_MAX_BACKUPS_PER_TYPE: usize = 5;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Process-level settings, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the facade binds to.
    pub host: String,

    /// Port the facade listens on.
    pub port: u16,

    /// Root of the managed data directory tree.
    pub data_dir: PathBuf,

    /// The data directory as the container daemon sees it. Used verbatim in
    /// bind-mount specifications; equal to `data_dir` unless the daemon runs
    /// with a different filesystem view.
    pub host_data_dir: PathBuf,

    /// Directory offered for server imports.
    pub import_dir: PathBuf,

    /// The import directory as the container daemon sees it.
    pub host_import_dir: PathBuf,

    /// Per-server, per-type backup retention cap.
    pub max_backups_per_type: usize,

    /// Whether stopping a server takes an automatic backup first.
    pub auto_backup_on_stop: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Settings {
    /// Builds settings from environment variables, applying defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        let host = std::env::var(HOST_ENV_VAR).unwrap_or_else(|_| DEFAULT_HOST.to_string());

        let port = std::env::var(PORT_ENV_VAR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let data_dir = PathBuf::from(
            std::env::var(DATA_DIR_ENV_VAR).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
        );

        let host_data_dir = std::env::var(HOST_DATA_DIR_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.clone());

        let import_dir = std::env::var(IMPORT_DIR_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("import"));

        let host_import_dir = std::env::var(HOST_IMPORT_DIR_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| import_dir.clone());

        let max_backups_per_type = std::env::var(MAX_BACKUPS_ENV_VAR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_BACKUPS_PER_TYPE);

        let auto_backup_on_stop = std::env::var(AUTO_BACKUP_ENV_VAR)
            .map(|s| !matches!(s.trim().to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        Self {
            host,
            port,
            data_dir,
            host_data_dir,
            import_dir,
            host_import_dir,
            max_backups_per_type,
            auto_backup_on_stop,
        }
    }

    /// The address string the facade binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The directory reserved for operator-placed configuration.
    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join(CONFIG_SUBDIR)
    }

    /// The directory holding template documents.
    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join(TEMPLATES_SUBDIR)
    }

    /// The directory holding managed server directories.
    pub fn servers_dir(&self) -> PathBuf {
        self.data_dir.join(SERVERS_SUBDIR)
    }

    /// The data directory of a single managed server.
    pub fn server_dir(&self, server_id: &str) -> PathBuf {
        self.servers_dir().join(server_id)
    }

    /// The server data directory as the container daemon sees it.
    pub fn host_server_dir(&self, server_id: &str) -> PathBuf {
        self.host_data_dir.join(SERVERS_SUBDIR).join(server_id)
    }

    /// The backup directory of a single managed server.
    pub fn backups_dir(&self, server_id: &str) -> PathBuf {
        self.data_dir.join(BACKUPS_SUBDIR).join(server_id)
    }

    /// The directory holding native-backend log captures.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_SUBDIR)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Settings {
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            host_data_dir: data_dir.clone(),
            import_dir: data_dir.join("import"),
            host_import_dir: data_dir.join("import"),
            data_dir,
            max_backups_per_type: DEFAULT_MAX_BACKUPS_PER_TYPE,
            auto_backup_on_stop: true,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bind_addr(), "0.0.0.0:3001");
        assert_eq!(settings.max_backups_per_type, 5);
        assert!(settings.auto_backup_on_stop);
    }

    #[test]
    fn test_server_paths() {
        let settings = Settings::default();
        assert_eq!(
            settings.server_dir("alpha-0011223344"),
            PathBuf::from("./data/servers/alpha-0011223344")
        );
        assert_eq!(
            settings.backups_dir("alpha-0011223344"),
            PathBuf::from("./data/backups/alpha-0011223344")
        );
    }
}
