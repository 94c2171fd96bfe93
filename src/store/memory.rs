//! In-memory story store.
//!
//! Useful for testing and dry runs.

use super::StoryStore;
use crate::error::{Result, ScenecastError};
use crate::pipeline::RunRecord;
use crate::story::{AssetOutcome, StoryModel};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory story store.
pub struct MemoryStoryStore {
    models: RwLock<HashMap<String, StoryModel>>,
    records: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryStoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> ScenecastError {
    ScenecastError::Store(format!("Failed to acquire lock: {}", e))
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn load(&self, run_id: &str) -> Result<Option<StoryModel>> {
        Ok(self.models.read().map_err(poisoned)?.get(run_id).cloned())
    }

    async fn save(&self, model: &StoryModel) -> Result<()> {
        self.models
            .write()
            .map_err(poisoned)?
            .insert(model.run_id.clone(), model.clone());
        Ok(())
    }

    async fn load_record(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.records.read().map_err(poisoned)?.get(run_id).cloned())
    }

    async fn save_record(&self, record: &RunRecord) -> Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> =
            self.records.read().map_err(poisoned)?.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn record_outcome(&self, run_id: &str, outcome: &AssetOutcome) -> Result<()> {
        let mut models = self.models.write().map_err(poisoned)?;
        let model = models
            .get_mut(run_id)
            .ok_or_else(|| ScenecastError::RunNotFound(run_id.to_string()))?;
        model.apply_outcome(outcome)
    }
}
