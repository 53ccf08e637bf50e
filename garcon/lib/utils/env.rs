//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the address the facade binds to.
pub const HOST_ENV_VAR: &str = "HOST";

/// Environment variable for the port the facade listens on.
pub const PORT_ENV_VAR: &str = "PORT";

/// Environment variable for the data directory root.
pub const DATA_DIR_ENV_VAR: &str = "DATA_DIR";

/// Environment variable for the data directory as the container daemon sees it.
pub const HOST_DATA_DIR_ENV_VAR: &str = "HOST_DATA_DIR";

/// Environment variable for the import directory.
pub const IMPORT_DIR_ENV_VAR: &str = "IMPORT_DIR";

/// Environment variable for the import directory as the container daemon sees it.
pub const HOST_IMPORT_DIR_ENV_VAR: &str = "HOST_IMPORT_DIR";

/// Environment variable for the container daemon socket.
pub const DOCKER_HOST_ENV_VAR: &str = "DOCKER_HOST";

/// Environment variable for the per-server, per-type backup retention cap.
pub const MAX_BACKUPS_ENV_VAR: &str = "MAX_BACKUPS_PER_TYPE";

/// Environment variable controlling the automatic backup taken on stop.
pub const AUTO_BACKUP_ENV_VAR: &str = "AUTO_BACKUP_ON_STOP";

/// Environment variable for the log filter.
pub const LOG_LEVEL_ENV_VAR: &str = "LOG_LEVEL";

/// Environment variable selecting human-readable log output.
pub const LOG_PRETTY_ENV_VAR: &str = "LOG_PRETTY";
