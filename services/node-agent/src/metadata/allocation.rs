//! Allocation reports exposed as the `allocation` metadata source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use plinth_constraint::FlatMap;

use crate::bus::{Consumer, Producer, Publisher};

/// State of one allocated pod as reported by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    /// Namespace the pod was scheduled from.
    pub namespace: String,

    /// Unit names belonging to the pod.
    pub units: Vec<String>,
}

/// Producer of per-pod allocation facts.
///
/// For every pod `name` the snapshot carries `name.present`,
/// `name.namespace`, `name.units` and `name.failures`.
pub struct Allocations {
    producer: Producer,
    pods: Mutex<HashMap<String, FlatMap>>,
}

impl Allocations {
    /// Source prefix.
    pub const PREFIX: &'static str = "allocation";

    /// Create an inactive allocation source.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            producer: Producer::new(Self::PREFIX),
            pods: Mutex::new(HashMap::new()),
        })
    }

    /// Replace all reports with the given pods.
    pub fn sync<'a, I>(&self, pods: I)
    where
        I: IntoIterator<Item = (&'a str, &'a AllocationReport)>,
    {
        let mut state = self.lock();
        state.clear();
        for (name, report) in pods {
            state.insert(name.to_string(), fields(name, report, &[]));
        }
        self.producer.store(true, flatten(&state));
    }

    /// Report one pod. `None` removes the pod.
    pub fn report(&self, name: &str, report: Option<&AllocationReport>, failures: &[String]) {
        let mut state = self.lock();
        match report {
            Some(report) => {
                state.insert(name.to_string(), fields(name, report, failures));
            }
            None => {
                state.remove(name);
            }
        }
        self.producer.store(true, flatten(&state));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FlatMap>> {
        self.pods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Publisher for Allocations {
    fn register_consumer(&self, name: &str, consumer: Arc<dyn Consumer>) {
        self.producer.register_consumer(name, consumer);
    }
}

fn fields(name: &str, report: &AllocationReport, failures: &[String]) -> FlatMap {
    FlatMap::from([
        (format!("{name}.present"), "true".to_string()),
        (format!("{name}.namespace"), report.namespace.clone()),
        (format!("{name}.units"), report.units.join(",")),
        (format!("{name}.failures"), format!("{failures:?}")),
    ])
}

fn flatten(pods: &HashMap<String, FlatMap>) -> FlatMap {
    pods.values().flatten().map(|(k, v)| (k.clone(), v.clone())).collect()
}
