//! Run persistence
//!
//! Run records outlive their process so failed or cancelled runs can be
//! resumed later. The [`RunStore`] trait keeps the orchestrator ignorant of
//! where records live: [`MemoryRunStore`] backs tests and embedding,
//! [`SledRunStore`] keeps JSON values in an embedded `sled` tree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::StoreError;

use super::run::PipelineRun;

/// Where run records persist
///
/// Implementations are synchronous; records are small and saves happen at
/// stage boundaries, off the hot path.
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record
    fn save(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Load a run record by id
    fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// Ids of every stored run
    fn list_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Delete a run record; deleting an absent id is not an error
    fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// In-memory store for tests and short-lived embedding
#[derive(Debug, Default, Clone)]
pub struct MemoryRunStore {
    runs: Arc<Mutex<HashMap<Uuid, PipelineRun>>>,
}

impl MemoryRunStore {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryRunStore::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, PipelineRun>>, StoreError> {
        self.runs
            .lock()
            .map_err(|_| StoreError::Backend("run store mutex poisoned".to_string()))
    }
}

impl RunStore for MemoryRunStore {
    fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.lock()?.insert(run.id, run.clone());
        Ok(())
    }

    fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids: Vec<Uuid> = self.lock()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()?.remove(&id);
        Ok(())
    }
}

/// Run store on an embedded `sled` database
///
/// Records are stored as JSON under the run id's bytes and flushed on every
/// save, so a crash right after a stage boundary loses nothing. Run ids are
/// time-ordered (UUIDv7), which makes `list_ids` chronological for free.
#[cfg(feature = "sled-store")]
#[derive(Debug, Clone)]
pub struct SledRunStore {
    db: sled::Db,
}

#[cfg(feature = "sled-store")]
impl SledRunStore {
    /// Open or create a store at the given directory
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Ok(SledRunStore {
            db: sled::open(path)?,
        })
    }
}

#[cfg(feature = "sled-store")]
impl RunStore for SledRunStore {
    fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let value = serde_json::to_vec(run)?;
        self.db.insert(run.id.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        match self.db.get(id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.db.remove(id.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}
