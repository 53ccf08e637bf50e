//! A scriptable in-memory execution provider used by tests to drive the
//! orchestrator without a container daemon or real processes.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    config::{ServerConfig, Template},
    GarconError, GarconResult,
};

use super::{CallbackHandle, ExecutionProvider, ExitCallback, ExitCallbackRegistry, ProcessStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory execution provider with scriptable failures.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    callbacks: ExitCallbackRegistry,
}

#[derive(Default)]
struct MockState {
    /// Artefacts that exist, with their running flag.
    instances: HashMap<String, bool>,

    /// Server ids whose next start call fails.
    fail_start: HashSet<String>,

    /// Server ids whose next stop call fails.
    fail_stop: HashSet<String>,

    /// Ordered operation log for assertions.
    operations: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockProvider {
    /// Creates an idle provider.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `start` for a server fail.
    pub async fn fail_next_start(&self, server_id: &str) {
        self.state
            .lock()
            .await
            .fail_start
            .insert(server_id.to_string());
    }

    /// Makes the next `stop` for a server fail.
    pub async fn fail_next_stop(&self, server_id: &str) {
        self.state
            .lock()
            .await
            .fail_stop
            .insert(server_id.to_string());
    }

    /// Simulates an unexpected instance exit, marking the artefact stopped
    /// (but retained) and dispatching exit callbacks.
    pub async fn emit_exit(&self, server_id: &str, exit_code: Option<i64>) {
        {
            let mut state = self.state.lock().await;
            if let Some(running) = state.instances.get_mut(server_id) {
                *running = false;
            }
            state.operations.push(format!("exit:{}", server_id));
        }
        self.callbacks.dispatch(server_id, exit_code);
    }

    /// Pre-seeds an artefact, optionally running, as ground truth for
    /// reconciliation tests.
    pub async fn seed_instance(&self, server_id: &str, running: bool) {
        self.state
            .lock()
            .await
            .instances
            .insert(server_id.to_string(), running);
    }

    /// The ordered log of operations the orchestrator performed.
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.operations.clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ExecutionProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn check_availability(&self) -> bool {
        true
    }

    async fn start_event_monitoring(&self) -> GarconResult<()> {
        Ok(())
    }

    fn on_process_exit(&self, callback: ExitCallback) -> CallbackHandle {
        self.callbacks.register(callback)
    }

    async fn get_process_status(&self, server_id: &str) -> GarconResult<ProcessStatus> {
        let state = self.state.lock().await;

        Ok(match state.instances.get(server_id) {
            Some(&running) => ProcessStatus {
                exists: true,
                running,
                native_id: Some(format!("mock-{}", server_id)),
            },
            None => ProcessStatus::default(),
        })
    }

    async fn start(
        &self,
        config: &ServerConfig,
        _template: &Template,
        _data_path: &Path,
    ) -> GarconResult<String> {
        let mut state = self.state.lock().await;
        state.operations.push(format!("start:{}", config.id));

        if state.fail_start.remove(&config.id) {
            return Err(GarconError::native_process(format!(
                "scripted start failure for '{}'",
                config.id
            )));
        }

        if state.instances.get(&config.id).copied().unwrap_or(false) {
            return Err(GarconError::conflict(format!(
                "server '{}' already running",
                config.id
            )));
        }

        state.instances.insert(config.id.clone(), true);
        Ok(format!("mock-{}", config.id))
    }

    async fn stop(
        &self,
        server_id: &str,
        _template: &Template,
        _timeout: Option<Duration>,
    ) -> GarconResult<()> {
        let mut state = self.state.lock().await;
        state.operations.push(format!("stop:{}", server_id));

        if state.fail_stop.remove(server_id) {
            return Err(GarconError::native_process(format!(
                "scripted stop failure for '{}'",
                server_id
            )));
        }

        state.instances.remove(server_id);
        Ok(())
    }

    async fn remove(&self, server_id: &str) -> GarconResult<()> {
        let mut state = self.state.lock().await;
        state.operations.push(format!("remove:{}", server_id));
        state.instances.remove(server_id);
        Ok(())
    }

    async fn reconcile(&self) -> GarconResult<()> {
        Ok(())
    }
}
