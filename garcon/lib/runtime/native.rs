//! The native-process execution backend, for games that cannot be
//! containerised.
//!
//! A per-server record (pid, process-image name, start time) is persisted on
//! every change so a restarted control plane can re-adopt still-alive
//! processes. Freshly spawned children are awaited through the child handle;
//! re-adopted processes fall back to a polling watcher.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::{process::Command, sync::RwLock, time::sleep};

use crate::{
    config::{RconConfig, ServerConfig, Template},
    store::FileStore,
    GarconError, GarconResult,
};

use super::{
    CallbackHandle, ExecutionProvider, ExitCallback, ExitCallbackRegistry, ProcessStatus,
    RconClient,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Interval of the polling watcher for re-adopted processes.
const READOPTED_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long to poll for exit after a force kill so the OS releases held
/// resources (ports, file locks) before we return.
const FORCE_KILL_EXIT_WAIT: Duration = Duration::from_secs(10);

/// Granularity of exit polling.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A persisted record of a natively-run server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeProcessRecord {
    /// The owning server id.
    pub server_id: String,

    /// The OS process id.
    pub pid: u32,

    /// The process-image name, checked on re-adoption to defend against pid
    /// reuse.
    pub process_name: String,

    /// When the process was started.
    pub started_at: DateTime<Utc>,
}

/// The native OS-process execution provider.
pub struct NativeProvider {
    inner: Arc<NativeProviderInner>,
}

struct NativeProviderInner {
    store: FileStore,
    records_path: PathBuf,
    logs_dir: PathBuf,
    servers_dir: PathBuf,
    records: RwLock<HashMap<String, NativeProcessRecord>>,
    callbacks: ExitCallbackRegistry,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NativeProvider {
    /// Creates a provider persisting records to `records_path`, capturing
    /// stdio under `logs_dir`, with server data directories under
    /// `servers_dir`.
    pub fn new(
        store: FileStore,
        records_path: PathBuf,
        logs_dir: PathBuf,
        servers_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(NativeProviderInner {
                store,
                records_path,
                logs_dir,
                servers_dir,
                records: RwLock::new(HashMap::new()),
                callbacks: ExitCallbackRegistry::new(),
            }),
        }
    }

    /// Snapshot of the current records, for inspection.
    pub async fn records(&self) -> Vec<NativeProcessRecord> {
        self.inner.records.read().await.values().cloned().collect()
    }

    async fn resolve_rcon(
        rcon: &RconConfig,
        data_path: &Path,
    ) -> (u16, String) {
        let mut port = *rcon.get_port();
        let mut password = rcon.get_password().clone();

        if let Some(file) = rcon.get_settings_file() {
            let path = data_path.join(file);
            match load_rcon_overrides(&path).await {
                Ok(Some((file_port, file_password))) => {
                    if let Some(p) = file_port {
                        port = p;
                    }
                    if let Some(p) = file_password {
                        password = p;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("failed to read rcon settings {}: {}", path.display(), e);
                }
            }
        }

        (port, password)
    }
}

impl NativeProviderInner {
    async fn persist_records(&self) -> GarconResult<()> {
        let records: Vec<NativeProcessRecord> =
            self.records.read().await.values().cloned().collect();
        self.store.write_json(&self.records_path, &records).await
    }

    async fn drop_record(&self, server_id: &str) -> bool {
        let removed = self.records.write().await.remove(server_id).is_some();
        if removed {
            if let Err(e) = self.persist_records().await {
                tracing::warn!("failed to persist native process records: {}", e);
            }
        }
        removed
    }

    /// Watches a re-adopted process by polling, since the child handle is
    /// gone after a control-plane restart.
    fn spawn_poll_watcher(self: &Arc<Self>, server_id: String, pid: u32) {
        let inner = self.clone();

        tokio::spawn(async move {
            loop {
                sleep(READOPTED_POLL_INTERVAL).await;

                // The record disappears when the server is stopped or
                // removed; stop watching then.
                if !inner.records.read().await.contains_key(&server_id) {
                    return;
                }

                if !pid_alive(pid) {
                    tracing::info!(server_id = %server_id, pid = pid, "re-adopted process exited");
                    inner.drop_record(&server_id).await;
                    inner.callbacks.dispatch(&server_id, None);
                    return;
                }
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ExecutionProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn check_availability(&self) -> bool {
        cfg!(target_os = "windows")
    }

    async fn start_event_monitoring(&self) -> GarconResult<()> {
        // Fresh children are awaited through their handles and re-adopted
        // processes get pollers during reconcile; nothing extra to start.
        Ok(())
    }

    fn on_process_exit(&self, callback: ExitCallback) -> CallbackHandle {
        self.inner.callbacks.register(callback)
    }

    async fn get_process_status(&self, server_id: &str) -> GarconResult<ProcessStatus> {
        let record = self.inner.records.read().await.get(server_id).cloned();

        let Some(record) = record else {
            return Ok(ProcessStatus::default());
        };

        Ok(ProcessStatus {
            exists: true,
            running: pid_alive(record.pid),
            native_id: Some(record.pid.to_string()),
        })
    }

    async fn start(
        &self,
        config: &ServerConfig,
        template: &Template,
        data_path: &Path,
    ) -> GarconResult<String> {
        let status = self.get_process_status(&config.id).await?;
        if status.running {
            return Err(GarconError::conflict(format!(
                "server '{}' already has a running process",
                config.id
            )));
        }

        let exec = template.get_exec().as_ref().ok_or_else(|| {
            GarconError::validation(format!(
                "template '{}' has no execution configuration",
                template.get_id()
            ))
        })?;

        let executable = exec.get_executable().as_ref().ok_or_else(|| {
            GarconError::validation(format!(
                "template '{}' declares no executable",
                template.get_id()
            ))
        })?;

        let exe_path = data_path.join(executable);
        if !self.inner.store.exists(&exe_path).await {
            return Err(GarconError::not_found(format!(
                "executable {} does not exist",
                exe_path.display()
            )));
        }

        self.inner.store.ensure_dir(&self.inner.logs_dir).await?;
        let log_path = self.inner.logs_dir.join(format!("{}.log", config.id));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_stderr = log_file.try_clone()?;

        let mut command = Command::new(&exe_path);
        command
            .args(exec.get_args())
            .current_dir(data_path)
            .envs(config.environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_stderr));

        // A dedicated process group makes the later tree-kill precise.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            GarconError::native_process(format!(
                "failed to launch {}: {}",
                exe_path.display(),
                e
            ))
        })?;

        let Some(pid) = child.id() else {
            let _ = child.kill().await;
            return Err(GarconError::native_process(format!(
                "process for server '{}' exited before a pid was available",
                config.id
            )));
        };

        let process_name = exe_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.clone());

        let record = NativeProcessRecord {
            server_id: config.id.clone(),
            pid,
            process_name,
            started_at: Utc::now(),
        };

        self.inner
            .records
            .write()
            .await
            .insert(config.id.clone(), record);
        self.inner.persist_records().await?;

        tracing::info!(server_id = %config.id, pid = pid, "native process started");

        // Observe exit through the child handle; the log sink is released
        // with the child.
        let inner = self.inner.clone();
        let server_id = config.id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code().map(|c| c as i64),
                Err(e) => {
                    tracing::warn!(server_id = %server_id, "failed to wait on child: {}", e);
                    None
                }
            };

            if inner.drop_record(&server_id).await {
                tracing::info!(
                    server_id = %server_id,
                    exit_code = ?exit_code,
                    "native process exited"
                );
                inner.callbacks.dispatch(&server_id, exit_code);
            }
        });

        Ok(pid.to_string())
    }

    async fn stop(
        &self,
        server_id: &str,
        template: &Template,
        timeout: Option<Duration>,
    ) -> GarconResult<()> {
        let record = self.inner.records.read().await.get(server_id).cloned();
        let Some(record) = record else {
            return Ok(());
        };

        if !pid_alive(record.pid) {
            self.inner.drop_record(server_id).await;
            return Ok(());
        }

        let stop_timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(template.stop_timeout_secs()));

        // Prefer an in-game shutdown over a kill when the template speaks
        // RCON.
        let rcon = template
            .get_exec()
            .as_ref()
            .and_then(|e| e.get_rcon().as_ref())
            .filter(|r| *r.get_enabled());

        if let Some(rcon) = rcon {
            let data_path = self.inner.servers_dir.join(server_id);
            let (port, password) = Self::resolve_rcon(rcon, &data_path).await;

            let client = RconClient::new(format!("127.0.0.1:{}", port), password);
            match client.execute(rcon.get_shutdown_command()).await {
                Ok(_) => {
                    if wait_for_exit(record.pid, stop_timeout).await {
                        self.inner.drop_record(server_id).await;
                        return Ok(());
                    }
                    tracing::warn!(
                        server_id = %server_id,
                        "process did not exit within {:?} after rcon shutdown",
                        stop_timeout
                    );
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, "rcon shutdown failed: {}", e);
                }
            }
        }

        tree_kill(record.pid);

        if !wait_for_exit(record.pid, FORCE_KILL_EXIT_WAIT).await {
            return Err(GarconError::native_process(format!(
                "process {} for server '{}' survived force kill",
                record.pid, server_id
            )));
        }

        self.inner.drop_record(server_id).await;

        Ok(())
    }

    async fn remove(&self, server_id: &str) -> GarconResult<()> {
        self.inner.drop_record(server_id).await;
        Ok(())
    }

    async fn reconcile(&self) -> GarconResult<()> {
        let loaded: Vec<NativeProcessRecord> =
            if self.inner.store.exists(&self.inner.records_path).await {
                self.inner.store.read_json(&self.inner.records_path).await?
            } else {
                Vec::new()
            };

        let mut adopted = HashMap::new();

        for record in loaded {
            if !pid_alive(record.pid) {
                tracing::info!(
                    server_id = %record.server_id,
                    pid = record.pid,
                    "native process no longer running; dropping record"
                );
                continue;
            }

            match process_name(record.pid) {
                Some(name) if process_names_match(&name, &record.process_name) => {
                    tracing::info!(
                        server_id = %record.server_id,
                        pid = record.pid,
                        "re-adopted native process"
                    );
                    self.inner
                        .spawn_poll_watcher(record.server_id.clone(), record.pid);
                    adopted.insert(record.server_id.clone(), record);
                }
                observed => {
                    tracing::warn!(
                        server_id = %record.server_id,
                        pid = record.pid,
                        expected = %record.process_name,
                        observed = ?observed,
                        "pid reused by another process; not re-adopting"
                    );
                }
            }
        }

        *self.inner.records.write().await = adopted;
        self.inner.persist_records().await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a pid refers to a live process.
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

/// The process-image name at a pid, if the process exists.
pub fn process_name(pid: u32) -> Option<String> {
    let mut system = System::new();
    if !system.refresh_process(Pid::from_u32(pid)) {
        return None;
    }
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.name().to_string())
}

/// Compares process-image names, ignoring a `.exe` suffix so records written
/// on one OS validate on another.
pub fn process_names_match(observed: &str, recorded: &str) -> bool {
    let strip = |s: &str| s.trim_end_matches(".exe").to_lowercase();
    strip(observed) == strip(recorded)
}

/// Polls for process exit, returning true once the pid is gone.
async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }

    !pid_alive(pid)
}

/// Kills a process and everything underneath it.
#[cfg(unix)]
fn tree_kill(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    // Children spawned by this provider run in their own process group.
    if let Err(e) = killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid = pid, "killpg failed ({}); killing the process directly", e);
        let mut system = System::new();
        if system.refresh_process(Pid::from_u32(pid)) {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                process.kill();
            }
        }
    }
}

/// Kills a process and everything underneath it.
#[cfg(windows)]
fn tree_kill(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();

    if let Err(e) = result {
        tracing::warn!(pid = pid, "taskkill failed: {}", e);
    }
}

/// Reads RCON credential overrides from a game settings file.
///
/// JSON documents are searched for `Rcon.Port` / `Rcon.Password` (the V
/// Rising layout); anything else is parsed as `key=value` properties with
/// `rcon.port` / `rcon.password` keys.
pub async fn load_rcon_overrides(
    path: &Path,
) -> GarconResult<Option<(Option<u16>, Option<String>)>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if path.extension().map_or(false, |e| e == "json") {
        let value: serde_json::Value = serde_json::from_str(&contents)?;
        let rcon = &value["Rcon"];
        let port = rcon["Port"].as_u64().and_then(|p| u16::try_from(p).ok());
        let password = rcon["Password"].as_str().map(|s| s.to_string());
        return Ok(Some((port, password)));
    }

    let mut port = None;
    let mut password = None;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        match key.trim() {
            "rcon.port" => port = value.trim().parse().ok(),
            "rcon.password" => {
                let value = value.trim();
                if !value.is_empty() {
                    password = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(Some((port, password)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_names_match_ignores_exe_suffix() {
        assert!(process_names_match("valheim_server", "valheim_server.exe"));
        assert!(process_names_match("VRisingServer.exe", "vrisingserver.exe"));
        assert!(!process_names_match("notepad", "valheim_server"));
    }

    #[tokio::test]
    async fn test_rcon_overrides_from_properties() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("server.properties");
        tokio::fs::write(
            &path,
            "# comment\nenable-rcon=true\nrcon.port=25580\nrcon.password=secret\n",
        )
        .await?;

        let overrides = load_rcon_overrides(&path).await?.unwrap();
        assert_eq!(overrides.0, Some(25580));
        assert_eq!(overrides.1.as_deref(), Some("secret"));

        Ok(())
    }

    #[tokio::test]
    async fn test_rcon_overrides_from_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ServerHostSettings.json");
        tokio::fs::write(
            &path,
            r#"{"Name":"alpha","Rcon":{"Enabled":true,"Port":25570,"Password":"vrpass"}}"#,
        )
        .await?;

        let overrides = load_rcon_overrides(&path).await?.unwrap();
        assert_eq!(overrides.0, Some(25570));
        assert_eq!(overrides.1.as_deref(), Some("vrpass"));

        Ok(())
    }

    #[tokio::test]
    async fn test_rcon_overrides_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let overrides = load_rcon_overrides(&dir.path().join("absent.json")).await?;
        assert!(overrides.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_rejects_reused_pid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();
        let records_path = dir.path().join("native-processes.json");

        // The current process is alive at a known pid, but its image name is
        // not "valheim_server" — re-adoption must refuse it.
        let records = vec![NativeProcessRecord {
            server_id: "valheim-0011223344".to_string(),
            pid: std::process::id(),
            process_name: "valheim_server".to_string(),
            started_at: Utc::now(),
        }];
        store.write_json(&records_path, &records).await?;

        let provider = NativeProvider::new(
            store,
            records_path.clone(),
            dir.path().join("logs"),
            dir.path().join("servers"),
        );
        provider.reconcile().await?;

        assert!(provider.records().await.is_empty());
        let status = provider
            .get_process_status("valheim-0011223344")
            .await?;
        assert!(!status.exists);

        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_drops_dead_pids() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();
        let records_path = dir.path().join("native-processes.json");

        let records = vec![NativeProcessRecord {
            server_id: "alpha-0011223344".to_string(),
            pid: u32::MAX - 1,
            process_name: "alpha_server".to_string(),
            started_at: Utc::now(),
        }];
        store.write_json(&records_path, &records).await?;

        let provider = NativeProvider::new(
            store.clone(),
            records_path.clone(),
            dir.path().join("logs"),
            dir.path().join("servers"),
        );
        provider.reconcile().await?;

        assert!(provider.records().await.is_empty());

        // The persisted file reflects the cleaned state.
        let persisted: Vec<NativeProcessRecord> = store.read_json(&records_path).await?;
        assert!(persisted.is_empty());

        Ok(())
    }
}
