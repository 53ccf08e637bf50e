//! Execution providers: pluggable backends that create, start, stop and
//! observe server instances.
//!
//! Two backends implement the [`ExecutionProvider`] contract: the container
//! backend drives the container daemon, the native backend runs OS
//! processes. Both surface unexpected exits through a shared fan-out
//! callback registry and reconcile their in-memory tracking against ground
//! truth at startup.

mod container;
mod mock;
mod native;
mod rcon;

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{ServerConfig, Template},
    GarconResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use container::*;
pub use mock::*;
pub use native::*;
pub use rcon::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A callback invoked when a managed instance dies unexpectedly, with the
/// server id and the exit code when the backend knows it.
pub type ExitCallback = Arc<dyn Fn(&str, Option<i64>) + Send + Sync>;

/// The status of a backend instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    /// Whether a backend artefact (container, process record) exists.
    pub exists: bool,

    /// Whether the instance is currently alive.
    pub running: bool,

    /// The backend-native identifier (container id, OS pid) when known.
    pub native_id: Option<String>,
}

/// A fan-out registry of exit callbacks shared by a provider and its watcher
/// tasks.
#[derive(Default, Clone)]
pub struct ExitCallbackRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    callbacks: Mutex<HashMap<u64, ExitCallback>>,
    next_id: AtomicU64,
}

/// Deregisters its callback when dropped.
pub struct CallbackHandle {
    registry: ExitCallbackRegistry,
    id: u64,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The contract implemented by every execution backend.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// A short identifier for logs ("container", "native").
    fn name(&self) -> &'static str;

    /// Whether this provider can operate on the current host.
    async fn check_availability(&self) -> bool;

    /// Begins asynchronous delivery of exit notifications. May be a no-op
    /// for providers that rely purely on polling.
    async fn start_event_monitoring(&self) -> GarconResult<()>;

    /// Registers an exit callback. Multiple callbacks may register; the
    /// returned handle deregisters on drop.
    fn on_process_exit(&self, callback: ExitCallback) -> CallbackHandle;

    /// Queries the backend for the instance status of a server.
    async fn get_process_status(&self, server_id: &str) -> GarconResult<ProcessStatus>;

    /// Creates whatever artefact is needed and starts the instance,
    /// returning a backend-specific identifier. Fails with a conflict when
    /// an instance is tracked and alive.
    async fn start(
        &self,
        config: &ServerConfig,
        template: &Template,
        data_path: &Path,
    ) -> GarconResult<String>;

    /// Gracefully stops the instance within the template's timeout, falling
    /// back to force-kill on expiry. Idempotent if already stopped.
    async fn stop(
        &self,
        server_id: &str,
        template: &Template,
        timeout: Option<Duration>,
    ) -> GarconResult<()>;

    /// Frees backend resources for a server. Idempotent.
    async fn remove(&self, server_id: &str) -> GarconResult<()>;

    /// Reconciles the provider's in-memory tracking with ground truth at
    /// startup.
    async fn reconcile(&self) -> GarconResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExitCallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback, returning a handle that deregisters on drop.
    pub fn register(&self, callback: ExitCallback) -> CallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .lock()
            .expect("exit callback registry poisoned")
            .insert(id, callback);

        CallbackHandle {
            registry: self.clone(),
            id,
        }
    }

    /// Dispatches an exit notification to every registered callback.
    pub fn dispatch(&self, server_id: &str, exit_code: Option<i64>) {
        let callbacks: Vec<ExitCallback> = {
            let guard = self
                .inner
                .callbacks
                .lock()
                .expect("exit callback registry poisoned");
            guard.values().cloned().collect()
        };

        for callback in callbacks {
            callback(server_id, exit_code);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Ok(mut callbacks) = self.registry.inner.callbacks.lock() {
            callbacks.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for ExitCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .callbacks
            .lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("ExitCallbackRegistry")
            .field("callbacks", &count)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_registry_fan_out_and_deregistration() {
        let registry = ExitCallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let handle_a = registry.register(Arc::new(move |_, _| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        }));

        let hits_b = hits.clone();
        let _handle_b = registry.register(Arc::new(move |_, _| {
            hits_b.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch("alpha-0011223344", Some(137));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(handle_a);
        registry.dispatch("alpha-0011223344", None);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
