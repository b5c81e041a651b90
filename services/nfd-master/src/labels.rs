//! Node feature records and the filter-then-write upsert behind `SetLabels`.
//!
//! A node's label `k = v` lives in one [`NodeFeature`] document, logically unique per
//! (`node_id`, `nfd_id`). Upserts for one node run behind a per-node lock so two calls for
//! the same node never interleave their lookup and write. A durable backend also carries a
//! unique index over those two fields; a create that loses a race against another process
//! is answered by looking the record up again and updating it.
use fleet_store::{DocumentStore, Entity, Filter, Repository, StoreError, StoreResult};
use fleet_wire::LabelStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeature {
    pub id: String,
    pub node_id: String,
    pub nfd_id: String,
    pub nfd_value: String,
}

impl Entity for NodeFeature {
    const TABLE: &'static str = "nodes_nfd_features";
    const FILTER_FIELDS: &'static [&'static str] = &["id", "node_id", "nfd_id", "nfd_value"];

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Fields that identify one label of one node.
pub const NODE_FEATURE_KEY: &[&str] = &["node_id", "nfd_id"];

/// Per-label outcomes of one call, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelReport {
    results: BTreeMap<String, LabelStatus>,
}

impl LabelReport {
    /// `(key, error)` of the first failed label in key order.
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.results.iter().find_map(|(key, status)| match status {
            LabelStatus::Failed { error } => Some((key.as_str(), error.as_str())),
            _ => None,
        })
    }

    pub fn results(&self) -> &BTreeMap<String, LabelStatus> {
        &self.results
    }

    pub fn into_results(self) -> BTreeMap<String, LabelStatus> {
        self.results
    }
}

pub struct LabelUpserter {
    features: Repository<NodeFeature>,
    node_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for LabelUpserter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelUpserter")
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl LabelUpserter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            features: Repository::new(store),
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn features(&self) -> &Repository<NodeFeature> {
        &self.features
    }

    fn node_lock(&self, node: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(node.to_string()).or_default())
    }

    /// Forget `node`'s lock once no other call holds a handle to it.
    fn release_node_lock(&self, node: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One handle lives in the map, the other is ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(node);
        }
        // Drop our handle before the map guard so the next releaser counts correctly.
        drop(lock);
    }

    #[cfg(test)]
    fn tracked_nodes(&self) -> usize {
        self.node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Write every label of `node`. A failed label is recorded and the rest still run.
    pub async fn apply(&self, node: &str, labels: &BTreeMap<String, String>) -> LabelReport {
        let lock = self.node_lock(node);
        let report = {
            let _guard = lock.lock().await;
            self.write_all(node, labels).await
        };
        self.release_node_lock(node, lock);
        report
    }

    async fn write_all(&self, node: &str, labels: &BTreeMap<String, String>) -> LabelReport {
        let mut report = LabelReport::default();
        for (key, value) in labels {
            let status = match self.upsert(node, key, value).await {
                Ok(status) => {
                    let op = if status == LabelStatus::Created {
                        "created"
                    } else {
                        "updated"
                    };
                    metrics::counter!("nfd_labels_written_total", "op" => op).increment(1);
                    status
                }
                Err(err) => {
                    tracing::warn!(node, label = %key, error = %err, "failed to store label");
                    metrics::counter!("nfd_labels_written_total", "op" => "failed").increment(1);
                    LabelStatus::Failed {
                        error: err.to_string(),
                    }
                }
            };
            report.results.insert(key.clone(), status);
        }
        report
    }

    /// Create or update the record for one label. Callers hold the node's lock.
    async fn upsert(&self, node: &str, key: &str, value: &str) -> StoreResult<LabelStatus> {
        match self.write_label(node, key, value).await {
            Err(StoreError::Conflict { .. }) => {
                // Another writer created the record between lookup and insert.
                tracing::debug!(node, label = key, "label created concurrently, retrying");
                self.write_label(node, key, value).await
            }
            result => result,
        }
    }

    async fn write_label(&self, node: &str, key: &str, value: &str) -> StoreResult<LabelStatus> {
        let existing = self
            .features
            .filter(&[Filter::eq("node_id", node), Filter::eq("nfd_id", key)])
            .await?;
        let mut feature = NodeFeature {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node.to_string(),
            nfd_id: key.to_string(),
            nfd_value: value.to_string(),
        };
        match existing.into_iter().next() {
            None => {
                self.features.create(&feature).await?;
                tracing::debug!(node, label = key, id = %feature.id, "label created");
                Ok(LabelStatus::Created)
            }
            Some(current) => {
                // Duplicates beyond the first match are left as they are.
                feature.set_id(current.id);
                self.features.bulk_update(&[feature]).await?;
                tracing::debug!(node, label = key, "label updated");
                Ok(LabelStatus::Updated)
            }
        }
    }
}
