//! Persistence of story models and run records.
//!
//! A store keeps, per run, the story model checkpoint written after every
//! pipeline step and the [`RunRecord`] describing where the run stands.
//! Generation outcomes are written with [`StoryStore::record_outcome`], which
//! updates the single row the outcome belongs to so concurrent workers never
//! overwrite each other's results.

mod memory;
mod sqlite;

pub use memory::MemoryStoryStore;
pub use sqlite::SqliteStoryStore;

use crate::error::Result;
use crate::pipeline::RunRecord;
use crate::story::{AssetOutcome, StoryModel};
use async_trait::async_trait;

/// Trait for story model stores.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Load the model checkpoint of a run.
    async fn load(&self, run_id: &str) -> Result<Option<StoryModel>>;

    /// Replace the model checkpoint of a run.
    async fn save(&self, model: &StoryModel) -> Result<()>;

    /// Load the record of a run.
    async fn load_record(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Insert or replace the record of a run.
    async fn save_record(&self, record: &RunRecord) -> Result<()>;

    /// All run records, most recently updated first.
    async fn list_records(&self) -> Result<Vec<RunRecord>>;

    /// Write one generation outcome to the record it targets.
    async fn record_outcome(&self, run_id: &str, outcome: &AssetOutcome) -> Result<()>;
}
