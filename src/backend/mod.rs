//! Execution backend abstraction.
//!
//! The [`ExecutionBackend`] trait unifies the two execution substrates
//! (tmux sessions and docker containers) behind one five-operation
//! contract. Only [`BackendRegistry`] maps a [`BackendKind`] to an
//! implementation; everything above it works with trait objects.

pub mod command;
pub mod container;
pub mod pty;
pub mod session;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::GlobalConfig;
use crate::models::agent::{AgentConfig, BackendKind};
use crate::{AppError, Result};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The instance exists and its supervised process is running.
    Alive,
    /// The substrate has no running instance under this handle.
    Gone,
}

/// Interactive duplex channel to an instance's controlling terminal.
///
/// Bytes sent on `input` reach the terminal; bytes read from the terminal
/// arrive on `output`. The output channel closes when the instance (or the
/// attach client) goes away. Dropping the stream releases the attach client
/// but never touches the instance.
pub struct AttachStream {
    /// Keystrokes towards the instance.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Terminal output from the instance.
    pub output: mpsc::Receiver<Vec<u8>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AttachStream {
    /// Wrap a pair of channels with no release hook.
    #[must_use]
    pub fn new(input: mpsc::Sender<Vec<u8>>, output: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            input,
            output,
            release: None,
        }
    }

    /// Run `release` when the stream is dropped.
    #[must_use]
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }
}

impl Drop for AttachStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for AttachStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachStream")
            .field("input_closed", &self.input.is_closed())
            .finish_non_exhaustive()
    }
}

/// Uniform contract over an execution substrate.
///
/// Implementations must leave no partial resource behind when `create`
/// fails, and must treat `terminate`/`destroy` of an absent instance as
/// success.
pub trait ExecutionBackend: Send + Sync {
    /// Start a new live instance bound to `workdir` and return its handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if the substrate cannot be
    /// reached, `AppError::ImageBuildFailed` if a required image cannot be
    /// built, or `AppError::CreateFailed` for any other startup failure.
    fn create<'a>(
        &'a self,
        agent_id: &'a str,
        workdir: &'a Path,
        config: &'a AgentConfig,
    ) -> BackendFuture<'a, String>;

    /// Check whether the instance behind `handle` is still alive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProbeTimeout` if the substrate does not answer in
    /// time, or `AppError::BackendUnavailable` if it cannot be reached.
    fn probe<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, Liveness>;

    /// Open an interactive stream to the instance's terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` if the instance is gone.
    fn attach<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, AttachStream>;

    /// Ask the instance to shut down gracefully. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if the substrate cannot be
    /// reached.
    fn terminate<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()>;

    /// Forcibly remove any substrate residue. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if the substrate cannot be
    /// reached.
    fn destroy<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()>;
}

/// A substrate instance recognised by naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    /// Agent id recovered from the instance name.
    pub agent_id: String,
    /// Handle accepted by [`ExecutionBackend::destroy`].
    pub handle: String,
}

/// Enumeration of substrate instances for the orphan sweep.
pub trait InstanceInventory: Send + Sync {
    /// List every instance whose name follows the agent naming convention.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if the substrate cannot be
    /// reached.
    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceRef>>;
}

/// Backend registered for one kind.
#[derive(Clone)]
struct Registration {
    backend: Arc<dyn ExecutionBackend>,
    inventory: Option<Arc<dyn InstanceInventory>>,
}

/// Maps each [`BackendKind`] to its implementation.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    entries: HashMap<BackendKind, Registration>,
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tmux and docker backends built from `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        let session = Arc::new(session::SessionBackend::new(
            config.agent.clone(),
            config.session.clone(),
            config.timeouts.clone(),
        ));
        let container = Arc::new(container::ContainerBackend::new(
            config.agent.clone(),
            config.container.clone(),
            config.timeouts.clone(),
        ));
        Self::new()
            .with_backend(BackendKind::Session, session.clone(), Some(session))
            .with_backend(BackendKind::Container, container.clone(), Some(container))
    }

    /// Register (or replace) the backend for `kind`.
    #[must_use]
    pub fn with_backend(
        mut self,
        kind: BackendKind,
        backend: Arc<dyn ExecutionBackend>,
        inventory: Option<Arc<dyn InstanceInventory>>,
    ) -> Self {
        self.entries.insert(kind, Registration { backend, inventory });
        self
    }

    /// Backend for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if nothing is registered.
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn ExecutionBackend>> {
        self.entries
            .get(&kind)
            .map(|entry| Arc::clone(&entry.backend))
            .ok_or_else(|| AppError::BackendUnavailable(format!("no {kind} backend registered")))
    }

    /// Backends that can enumerate their instances, with their kind.
    #[must_use]
    pub fn inventories(
        &self,
    ) -> Vec<(BackendKind, Arc<dyn ExecutionBackend>, Arc<dyn InstanceInventory>)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(kind, entry)| {
                entry
                    .inventory
                    .as_ref()
                    .map(|inv| (*kind, Arc::clone(&entry.backend), Arc::clone(inv)))
            })
            .collect();
        out.sort_by_key(|(kind, _, _)| kind.as_str());
        out
    }
}

/// Recover an agent id from an instance name carrying `prefix`.
#[must_use]
pub fn agent_id_from_name<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    name.strip_prefix(prefix).filter(|id| !id.is_empty())
}
