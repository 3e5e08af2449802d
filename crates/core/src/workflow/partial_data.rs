use crate::error::{Result, WorkflowError};
use crate::types::{NodeId, Params, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Data produced by `from_node` for consumption by `for_node`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialData {
    pub request_id: RequestId,
    pub for_node: NodeId,
    pub from_node: NodeId,
    pub data: Params,
}

impl PartialData {
    pub fn new(request_id: RequestId, for_node: NodeId, from_node: NodeId, data: Params) -> Self {
        Self {
            request_id,
            for_node,
            from_node,
            data,
        }
    }
}

type Staged = HashMap<RequestId, HashMap<NodeId, Vec<PartialData>>>;

/// Process-wide staging area for data in flight between nodes, keyed by
/// request and target node.
#[derive(Clone, Default)]
pub struct PartialDataStore {
    staged: Arc<Mutex<Staged>>,
}

impl PartialDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save(&self, data: PartialData) {
        tracing::debug!(
            "Staging partial data for node {} from {} (request {})",
            data.for_node,
            data.from_node,
            data.request_id
        );
        self.lock()
            .entry(data.request_id.clone())
            .or_default()
            .entry(data.for_node.clone())
            .or_default()
            .push(data);
    }

    /// Every entry staged for `node`, without consuming them.
    pub fn retrieve(&self, request_id: &RequestId, node: &NodeId) -> Vec<PartialData> {
        self.lock()
            .get(request_id)
            .and_then(|by_node| by_node.get(node))
            .cloned()
            .unwrap_or_default()
    }

    /// The single entry staged for `node`.
    pub fn retrieve_single(&self, request_id: &RequestId, node: &NodeId) -> Result<PartialData> {
        let mut entries = self.retrieve(request_id, node);
        match entries.len() {
            1 => Ok(entries.remove(0)),
            0 => Err(WorkflowError::PartialDataNotFound {
                request: request_id.clone(),
                node: node.clone(),
            }),
            n => Err(WorkflowError::InvalidGraph(format!(
                "node {} expects one input but {} were staged",
                node, n
            ))),
        }
    }

    /// Remove and return everything staged for `node`.
    pub fn consume(&self, request_id: &RequestId, node: &NodeId) -> Vec<PartialData> {
        self.lock()
            .get_mut(request_id)
            .and_then(|by_node| by_node.remove(node))
            .unwrap_or_default()
    }

    pub fn count(&self, request_id: &RequestId, node: &NodeId) -> usize {
        self.lock()
            .get(request_id)
            .and_then(|by_node| by_node.get(node))
            .map_or(0, Vec::len)
    }

    /// Drop all data of a request. Returns the number of entries removed.
    pub fn purge(&self, request_id: &RequestId) -> usize {
        self.lock()
            .remove(request_id)
            .map_or(0, |by_node| by_node.values().map(Vec::len).sum())
    }
}
