//! Metadata manager - aggregates sources and arbitrates managed resources.
//!
//! The manager receives snapshots from every registered source, rebuilds
//! two caches from scratch on each update and re-evaluates the constraint of
//! every managed resource:
//!
//! - **Interpolatable cache**: data eligible for templating (excludes
//!   constraint-only sources)
//! - **Containable cache**: data eligible for constraint checks
//!
//! Sources that are not clean mark their namespaces dirty. Resources in a
//! dirty namespace keep their last verdict until the namespace is clean
//! again. Sources with a required constraint gate every resource.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use plinth_constraint::{content_hash, Constraint, ConstraintError, FlatMap};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::actors::stop_requested;
use crate::bus::{Consumer, Message};

/// Errors raised while building a manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Two sources declare the same prefix.
    #[error("duplicate manager source: {0}")]
    DuplicateSource(String),
}

/// Binding of a producer to the manager.
#[derive(Debug, Clone)]
pub struct ManagerSource {
    prefix: String,
    constraint_only: bool,
    namespaces: Vec<String>,
    required: Option<Constraint>,
}

impl ManagerSource {
    /// Source bound to producer `prefix`, interpolatable, with no namespaces.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            constraint_only: false,
            namespaces: Vec::new(),
            required: None,
        }
    }

    /// Use the source for constraints only.
    pub fn constraint_only(mut self) -> Self {
        self.constraint_only = true;
        self
    }

    /// Namespaces marked dirty while the source is not clean.
    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Hard gate checked before every resource constraint.
    pub fn required(mut self, constraint: Constraint) -> Self {
        self.required = Some(constraint);
        self
    }

    /// Producer prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Outcome delivered to a managed resource.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Constraint verdict.
    pub result: Result<(), ConstraintError>,

    /// Interpolation environment at evaluation time.
    pub environment: Arc<FlatMap>,

    /// Content hash of `environment`.
    pub mark: u64,
}

/// Callback invoked with every evaluation of a managed resource.
///
/// Runs under the manager lock: it must not call back into the manager.
pub type ResourceCallback = Arc<dyn Fn(Evaluation) + Send + Sync>;

/// Resource whose admission depends on a constraint.
#[derive(Clone)]
pub struct ManagedResource {
    /// Namespace the resource belongs to.
    pub namespace: String,

    /// Resource constraint.
    pub constraint: Constraint,

    /// Notification callback.
    pub callback: ResourceCallback,
}

impl ManagedResource {
    /// Create a managed resource.
    pub fn new<F>(namespace: impl Into<String>, constraint: Constraint, callback: F) -> Self
    where
        F: Fn(Evaluation) + Send + Sync + 'static,
    {
        Self {
            namespace: namespace.into(),
            constraint,
            callback: Arc::new(callback),
        }
    }
}

struct SourceSlot {
    source: ManagerSource,
    message: Message,
}

struct ManagerState {
    sources: Vec<SourceSlot>,
    index: HashMap<String, usize>,
    managed: HashMap<String, ManagedResource>,
    dirty_namespaces: BTreeSet<String>,
    interpolatable: Arc<FlatMap>,
    interpolatable_mark: u64,
    containable: FlatMap,
}

enum ManagerTask {
    Register {
        name: String,
        resource: ManagedResource,
    },
    Deregister {
        name: String,
        done: Box<dyn FnOnce() + Send>,
    },
}

/// Aggregates sources and evaluates managed resources.
pub struct Manager {
    state: Mutex<ManagerState>,
    tasks: mpsc::UnboundedSender<ManagerTask>,
}

impl Manager {
    /// Build a manager and start its registration loop.
    ///
    /// Must be called inside a Tokio runtime. The loop exits when
    /// `shutdown` flips to `true`.
    pub fn start(
        sources: Vec<ManagerSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, ManagerError> {
        let mut index = HashMap::new();
        let mut dirty_namespaces = BTreeSet::new();
        let mut slots = Vec::with_capacity(sources.len());
        for source in sources {
            if index.insert(source.prefix.clone(), slots.len()).is_some() {
                return Err(ManagerError::DuplicateSource(source.prefix));
            }
            dirty_namespaces.extend(source.namespaces.iter().cloned());
            slots.push(SourceSlot {
                message: Message::dirty(source.prefix.clone()),
                source,
            });
        }

        let interpolatable = Arc::new(FlatMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            state: Mutex::new(ManagerState {
                sources: slots,
                index,
                managed: HashMap::new(),
                dirty_namespaces,
                interpolatable_mark: content_hash(&interpolatable),
                interpolatable,
                containable: FlatMap::new(),
            }),
            tasks: tx,
        });

        info!(
            sources = manager.lock().sources.len(),
            "Starting metadata manager"
        );
        tokio::spawn(run_registration_loop(Arc::downgrade(&manager), rx, shutdown));
        Ok(manager)
    }

    /// Add or replace a managed resource.
    ///
    /// Returns immediately; the resource is evaluated once it is applied.
    pub fn register_resource(&self, name: impl Into<String>, resource: ManagedResource) {
        let name = name.into();
        if self
            .tasks
            .send(ManagerTask::Register { name, resource })
            .is_err()
        {
            warn!("Manager stopped, ignoring registration");
        }
    }

    /// Remove a managed resource and call `done` once removed.
    pub fn deregister_resource<F>(&self, name: impl Into<String>, done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        if self
            .tasks
            .send(ManagerTask::Deregister {
                name,
                done: Box::new(done),
            })
            .is_err()
        {
            warn!("Manager stopped, ignoring deregistration");
        }
    }

    /// Currently dirty namespaces.
    pub fn dirty_namespaces(&self) -> Vec<String> {
        self.lock().dirty_namespaces.iter().cloned().collect()
    }

    /// Current interpolation environment and its mark.
    pub fn environment(&self) -> (Arc<FlatMap>, u64) {
        let state = self.lock();
        (Arc::clone(&state.interpolatable), state.interpolatable_mark)
    }

    /// Number of managed resources.
    pub fn resource_count(&self) -> usize {
        self.lock().managed.len()
    }

    fn apply(&self, task: ManagerTask) {
        match task {
            ManagerTask::Register { name, resource } => {
                let mut state = self.lock();
                info!(
                    resource = %name,
                    namespace = %resource.namespace,
                    constraint = ?resource.constraint,
                    "Registering resource"
                );
                state.notify_resource(&name, &resource);
                state.managed.insert(name, resource);
            }
            ManagerTask::Deregister { name, done } => {
                let removed = self.lock().managed.remove(&name).is_some();
                info!(resource = %name, removed, "Deregistered resource");
                done();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Consumer for Manager {
    fn consume(&self, message: Message) {
        trace!(prefix = %message.prefix, clean = message.clean, "Got message");
        let mut state = self.lock();

        let Some(&idx) = state.index.get(&message.prefix) else {
            warn!(prefix = %message.prefix, "Message from unknown source ignored");
            return;
        };

        let gated = state.sources[idx].source.required.is_some() || message.clean;
        state.sources[idx].message = message;

        let previous = state.dirty_namespaces.clone();
        state.rebuild();
        if previous != state.dirty_namespaces {
            info!(
                previous = ?previous,
                current = ?state.dirty_namespaces,
                "Dirty namespaces changed"
            );
        }

        if !gated {
            return;
        }

        let state: &ManagerState = &state;
        for (name, resource) in &state.managed {
            state.notify_resource(name, resource);
        }
    }
}

impl ManagerState {
    /// Rebuild caches and dirty namespaces from the last message of every
    /// source.
    fn rebuild(&mut self) {
        let mut interpolatable = FlatMap::new();
        let mut containable = FlatMap::new();
        let mut dirty = BTreeSet::new();

        for slot in &self.sources {
            if slot.source.required.is_some() || slot.message.clean {
                for (k, v) in &slot.message.data {
                    let key = format!("{}.{}", slot.source.prefix, k);
                    if !slot.source.constraint_only {
                        interpolatable.insert(key.clone(), v.clone());
                    }
                    containable.insert(key, v.clone());
                }
                continue;
            }
            dirty.extend(slot.source.namespaces.iter().cloned());
        }

        self.interpolatable_mark = content_hash(&interpolatable);
        self.interpolatable = Arc::new(interpolatable);
        self.containable = containable;
        self.dirty_namespaces = dirty;
    }

    fn notify_resource(&self, name: &str, resource: &ManagedResource) {
        trace!(resource = %name, "Evaluating resource");

        for slot in &self.sources {
            let Some(required) = &slot.source.required else {
                continue;
            };
            if let Err(cause) = required.check(&self.containable) {
                warn!(
                    resource = %name,
                    source = %slot.source.prefix,
                    error = %cause,
                    "Required constraint failed"
                );
                (resource.callback)(self.evaluation(Err(ConstraintError::Required {
                    source_prefix: slot.source.prefix.clone(),
                    cause: Box::new(cause),
                })));
                return;
            }
        }

        if self.dirty_namespaces.contains(&resource.namespace) {
            trace!(
                resource = %name,
                namespace = %resource.namespace,
                "Namespace is dirty, skipping"
            );
            return;
        }

        let result = resource.constraint.check(&self.containable);
        debug!(resource = %name, ok = result.is_ok(), "Resource notified");
        (resource.callback)(self.evaluation(result));
    }

    fn evaluation(&self, result: Result<(), ConstraintError>) -> Evaluation {
        Evaluation {
            result,
            environment: Arc::clone(&self.interpolatable),
            mark: self.interpolatable_mark,
        }
    }
}

async fn run_registration_loop(
    manager: std::sync::Weak<Manager>,
    mut rx: mpsc::UnboundedReceiver<ManagerTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            () = stop_requested(&mut shutdown) => {
                info!("Manager registration loop shutting down");
                break;
            }

            task = rx.recv() => {
                let Some(task) = task else { break };
                let Some(manager) = manager.upgrade() else { break };
                manager.apply(task);
            }
        }
    }
}
