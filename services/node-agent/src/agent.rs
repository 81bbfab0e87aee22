//! Agent wiring.
//!
//! Connects the metadata sources, the KV backend and the manager:
//!
//! ```text
//! agent ──────┬──> manager
//!             └──> announcer ──> kv nodes/<id>
//! meta ───────────> manager
//! allocation ─────> manager
//! kv nodes/* ─> nodes pipe ──> manager
//! ```

use std::sync::Arc;

use plinth_constraint::{Constraint, FlatMap};
use tokio::sync::watch;
use tracing::info;

use crate::actors::Supervisor;
use crate::bus::{Pipe, Producer, Publisher};
use crate::config::Config;
use crate::kv::{Announcer, Backend, Connector};
use crate::metadata::{nodes_pipe, Allocations, Manager, ManagerError, ManagerSource};

/// Namespace of workloads confined to this node.
pub const PRIVATE_NAMESPACE: &str = "private";

/// Namespace of workloads that depend on cluster state.
pub const PUBLIC_NAMESPACE: &str = "public";

/// A running agent.
pub struct Agent {
    id: String,
    agent: Arc<Producer>,
    meta: Arc<Producer>,
    allocations: Arc<Allocations>,
    manager: Arc<Manager>,
    backend: Arc<Backend>,
    nodes: Arc<Pipe>,
    supervisor: Supervisor,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Wire every component and publish the initial agent metadata.
    pub fn start(config: Config, connector: Arc<dyn Connector>) -> Result<Self, ManagerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx.clone());

        let manager = Manager::start(manager_sources(), shutdown_rx)?;

        let agent = Arc::new(Producer::new("agent"));
        let meta = Arc::new(Producer::new("meta"));
        let allocations = Allocations::new();

        let backend = Backend::start(config.kv.clone(), connector, &mut supervisor);
        let nodes = Pipe::bind("nodes", backend.as_ref(), Some(nodes_pipe()));

        agent.register_consumer("manager", manager.clone());
        meta.register_consumer("manager", manager.clone());
        allocations.register_consumer("manager", manager.clone());
        nodes.register_consumer("manager", manager.clone());

        let announcer = Announcer::start(backend.clone(), format!("nodes/{}", config.agent_id));
        agent.register_consumer("announcer", announcer);

        meta.replace(Some(config.meta.clone()));
        agent.replace(Some(FlatMap::from([
            ("id".to_string(), config.agent_id.clone()),
            ("advertise".to_string(), config.advertise.clone()),
            ("drain".to_string(), "false".to_string()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ])));

        info!(agent_id = %config.agent_id, public = config.kv.enabled, "Agent started");

        Ok(Self {
            id: config.agent_id,
            agent,
            meta,
            allocations,
            manager,
            backend,
            nodes,
            supervisor,
            shutdown_tx,
        })
    }

    /// Agent id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Toggle drain mode. A draining agent rejects every resource.
    pub fn drain(&self, on: bool) {
        info!(agent_id = %self.id, drain = on, "Drain mode changed");
        self.agent.put(true, FlatMap::from([("drain".to_string(), on.to_string())]));
    }

    /// Replace operator metadata.
    pub fn configure_meta(&self, meta: FlatMap) {
        self.meta.replace(Some(meta));
    }

    /// Allocation source.
    pub fn allocations(&self) -> &Arc<Allocations> {
        &self.allocations
    }

    /// Resource arbiter.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// KV backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Flattened view of the cluster's node announcements.
    pub fn nodes(&self) -> &Arc<Pipe> {
        &self.nodes
    }

    /// Stop every loop and actor.
    pub async fn shutdown(mut self) {
        info!(agent_id = %self.id, "Agent shutting down");
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop_all().await;
    }
}

fn manager_sources() -> Vec<ManagerSource> {
    vec![
        ManagerSource::new("agent")
            .namespaces([PRIVATE_NAMESPACE, PUBLIC_NAMESPACE])
            .required(Constraint::new().with("${agent.drain}", "!= true")),
        ManagerSource::new("meta").namespaces([PRIVATE_NAMESPACE, PUBLIC_NAMESPACE]),
        ManagerSource::new(Allocations::PREFIX).constraint_only(),
        ManagerSource::new("nodes")
            .constraint_only()
            .namespaces([PUBLIC_NAMESPACE]),
    ]
}
