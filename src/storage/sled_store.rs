use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::{ActivityTask, ActivityTaskStatus, HistoryEvent, HistoryStore, InstanceRecord};
use crate::core::errors::{FlowError, Result};

const INSTANCES_TREE: &str = "instances";
const HISTORY_TREE: &str = "history";
const TASKS_TREE: &str = "activity_tasks";

const COMPRESSION_LEVEL: i32 = 3;

/// sled-backed [`HistoryStore`]. Values are bincode-encoded and zstd-compressed.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    instances: sled::Tree,
    history: sled::Tree,
    tasks: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| FlowError::database(format!("open {}", path.display()), e))?;
        info!("Opened history store at {}", path.display());
        Self::from_db(db)
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FlowError::database("open temporary", e))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            instances: db.open_tree(INSTANCES_TREE)?,
            history: db.open_tree(HISTORY_TREE)?,
            tasks: db.open_tree(TASKS_TREE)?,
            db,
        })
    }

    fn history_prefix(instance_id: &str) -> Vec<u8> {
        let mut prefix = instance_id.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(value)?;
    zstd::encode_all(&*serialized, COMPRESSION_LEVEL)
        .map_err(|e| FlowError::io("zstd compress", e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let decompressed =
        zstd::decode_all(bytes).map_err(|e| FlowError::io("zstd decompress", e))?;
    Ok(bincode::deserialize(&decompressed)?)
}

#[async_trait]
impl HistoryStore for SledStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let swapped = self.instances.compare_and_swap(
            record.instance_id.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        Ok(swapped.is_ok())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        match self.instances.get(instance_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.instances
            .insert(record.instance_id.as_bytes(), encode(record)?)?;
        Ok(())
    }

    async fn list_open_instances(&self) -> Result<Vec<InstanceRecord>> {
        let mut open = Vec::new();
        for item in self.instances.iter() {
            let (_, bytes) = item?;
            let record: InstanceRecord = decode(&bytes)?;
            if !record.is_terminal() {
                open.push(record);
            }
        }
        Ok(open)
    }

    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<()> {
        let mut key = Self::history_prefix(instance_id);
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        self.history.insert(key, encode(event)?)?;
        debug!(instance_id, ?event, "history event appended");
        Ok(())
    }

    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        self.history
            .scan_prefix(Self::history_prefix(instance_id))
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    async fn put_task(&self, task: &ActivityTask) -> Result<()> {
        self.tasks.insert(task.task_id.as_bytes(), encode(task)?)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<ActivityTask>> {
        match self.tasks.get(task_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, status: ActivityTaskStatus) -> Result<Vec<ActivityTask>> {
        let mut tasks = Vec::new();
        for item in self.tasks.iter() {
            let (_, bytes) = item?;
            let task: ActivityTask = decode(&bytes)?;
            if task.status == status {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(tasks)
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FlowError::database("flush", e))?;
        Ok(())
    }
}
