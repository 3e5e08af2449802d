use crate::error::{storage_err, Result};
use crate::types::{NodeId, RequestId};
use crate::workflow::partial_data::PartialData;
use crate::workflow::progress::Progress;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const PROGRESS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("progress");
const PARTIAL_DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("partial_data");

/// Durable copy of per-request execution state, kept for crash recovery.
/// Control flow reads the in-memory stores; a request is loaded back from
/// here only when it is resumed.
pub trait StateStore: Send + Sync {
    fn save_progress(&self, progress: &Progress) -> Result<()>;

    fn load_progress(&self, request_id: &RequestId) -> Result<Option<Progress>>;

    fn save_partial_data(&self, data: &PartialData) -> Result<()>;

    /// Entries staged for `node`, ordered by source node.
    fn load_partial_data(&self, request_id: &RequestId, node: &NodeId) -> Result<Vec<PartialData>>;

    /// Remove the entries staged for `node` once it has run.
    fn consume_partial_data(&self, request_id: &RequestId, node: &NodeId) -> Result<()>;

    /// Remove everything stored for a request.
    fn purge(&self, request_id: &RequestId) -> Result<()>;
}

/// Keeps nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStateStore;

impl StateStore for NoopStateStore {
    fn save_progress(&self, _progress: &Progress) -> Result<()> {
        Ok(())
    }

    fn load_progress(&self, _request_id: &RequestId) -> Result<Option<Progress>> {
        Ok(None)
    }

    fn save_partial_data(&self, _data: &PartialData) -> Result<()> {
        Ok(())
    }

    fn load_partial_data(&self, _request_id: &RequestId, _node: &NodeId) -> Result<Vec<PartialData>> {
        Ok(Vec::new())
    }

    fn consume_partial_data(&self, _request_id: &RequestId, _node: &NodeId) -> Result<()> {
        Ok(())
    }

    fn purge(&self, _request_id: &RequestId) -> Result<()> {
        Ok(())
    }
}

/// State store backed by redb
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_err)?;
        }

        let db = Database::create(&path).map_err(storage_err)?;

        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _progress_table = write_txn.open_table(PROGRESS_TABLE).map_err(storage_err)?;
            let _partial_data_table = write_txn
                .open_table(PARTIAL_DATA_TABLE)
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        tracing::info!("Opened state store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    fn partial_data_key(data: &PartialData) -> String {
        format!("{}/{}/{}", data.request_id, data.for_node, data.from_node)
    }

    fn node_prefix(request_id: &RequestId, node: &NodeId) -> String {
        format!("{}/{}/", request_id, node)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(PARTIAL_DATA_TABLE).map_err(storage_err)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..).map_err(storage_err)? {
            let (key, _value) = item.map_err(storage_err)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

impl StateStore for RedbStateStore {
    fn save_progress(&self, progress: &Progress) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(PROGRESS_TABLE).map_err(storage_err)?;

            let key = progress.request_id.to_string();
            let value = serde_json::to_vec(progress)?;

            table
                .insert(key.as_str(), value.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn load_progress(&self, request_id: &RequestId) -> Result<Option<Progress>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(PROGRESS_TABLE).map_err(storage_err)?;

        let key = request_id.to_string();
        match table.get(key.as_str()).map_err(storage_err)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn save_partial_data(&self, data: &PartialData) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn
                .open_table(PARTIAL_DATA_TABLE)
                .map_err(storage_err)?;

            let key = Self::partial_data_key(data);
            let value = serde_json::to_vec(data)?;

            table
                .insert(key.as_str(), value.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn load_partial_data(&self, request_id: &RequestId, node: &NodeId) -> Result<Vec<PartialData>> {
        let prefix = Self::node_prefix(request_id, node);
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(PARTIAL_DATA_TABLE).map_err(storage_err)?;

        let mut entries = Vec::new();
        for item in table.range(prefix.as_str()..).map_err(storage_err)? {
            let (key, value) = item.map_err(storage_err)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    fn consume_partial_data(&self, request_id: &RequestId, node: &NodeId) -> Result<()> {
        let keys = self.keys_with_prefix(&Self::node_prefix(request_id, node))?;
        if keys.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn
                .open_table(PARTIAL_DATA_TABLE)
                .map_err(storage_err)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn purge(&self, request_id: &RequestId) -> Result<()> {
        let prefix = format!("{}/", request_id);
        let keys = self.keys_with_prefix(&prefix)?;

        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut progress = write_txn.open_table(PROGRESS_TABLE).map_err(storage_err)?;
            progress
                .remove(request_id.to_string().as_str())
                .map_err(storage_err)?;

            let mut partial = write_txn
                .open_table(PARTIAL_DATA_TABLE)
                .map_err(storage_err)?;
            for key in &keys {
                partial.remove(key.as_str()).map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;

        tracing::debug!("Purged {} staged entries of request {}", keys.len(), request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builder::sequence_dag;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, RedbStateStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbStateStore::new(temp_dir.path().join("state.redb")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_progress_persists() {
        let (_dir, store) = store();
        let dag = sequence_dag(&["a"]).unwrap();
        let mut progress = Progress::new(RequestId::new(), &dag).unwrap();
        progress.complete_node(&dag.start).unwrap();

        store.save_progress(&progress).unwrap();
        let loaded = store.load_progress(&progress.request_id).unwrap().unwrap();
        assert_eq!(loaded, progress);
        assert!(store.load_progress(&RequestId::new()).unwrap().is_none());
    }

    #[test]
    fn test_partial_data_prefix_scan_and_purge() {
        let (_dir, store) = store();
        let request = RequestId::from_string("req-1");
        let other = RequestId::from_string("req-10");
        let data = |req: &RequestId, to: &str, from: &str| {
            PartialData::new(
                req.clone(),
                NodeId::new(to),
                NodeId::new(from),
                json!({"from": from}).as_object().cloned().unwrap(),
            )
        };

        store.save_partial_data(&data(&request, "fan_in", "b")).unwrap();
        store.save_partial_data(&data(&request, "fan_in", "a")).unwrap();
        store.save_partial_data(&data(&request, "next", "a")).unwrap();
        store.save_partial_data(&data(&other, "fan_in", "c")).unwrap();
        store.save_partial_data(&data(&request, "fan", "x")).unwrap();

        let staged = store
            .load_partial_data(&request, &NodeId::new("fan_in"))
            .unwrap();
        let sources: Vec<&str> = staged.iter().map(|d| d.from_node.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);

        store.consume_partial_data(&request, &NodeId::new("fan")).unwrap();
        assert!(store
            .load_partial_data(&request, &NodeId::new("fan"))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .load_partial_data(&request, &NodeId::new("fan_in"))
                .unwrap()
                .len(),
            2
        );

        store.purge(&request).unwrap();
        assert!(store
            .load_partial_data(&request, &NodeId::new("fan_in"))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .load_partial_data(&other, &NodeId::new("fan_in"))
                .unwrap()
                .len(),
            1
        );
    }
}
