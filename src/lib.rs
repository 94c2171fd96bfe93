//! Scenecast - narrated audio to storyboarded, generated scenes
//!
//! A CLI tool that turns the captions of a narrated recording into a
//! structured story model and drives parallel image/video generation for
//! every scene.
//!
//! # Overview
//!
//! Scenecast allows you to:
//! - Run a resumable, checkpointed pipeline of AI-assisted story steps
//! - Queue one generation task per scene asset (and reference portraits)
//! - Drain the queue with a pool of account-bound generation sessions
//! - Export the generated assets with a manifest for assembly
//!
//! # Architecture
//!
//! - `config` - Configuration and prompt templates
//! - `transcription` - Caption parsing (the seed of every run)
//! - `story` - The story model and its validation
//! - `pipeline` - Step execution and run coordination
//! - `store` - Story model persistence
//! - `llm` - Text generation backend
//! - `generation` - Image/video generation clients
//! - `tasks` - Generation tasks and the shared queue
//! - `worker` - Worker sessions and the pool
//! - `orchestrator` - Run control surface
//!
//! # Example
//!
//! ```rust,no_run
//! use scenecast::config::Settings;
//! use scenecast::orchestrator::{GenerateOptions, Orchestrator};
//! use scenecast::transcription::load_captions;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let orchestrator = Orchestrator::new(settings)?;
//!     let cancel = CancellationToken::new();
//!
//!     let captions = load_captions(std::path::Path::new("lighthouse.srt"))?;
//!     orchestrator.start("lighthouse", captions, &cancel).await?;
//!
//!     let result = orchestrator
//!         .generate("lighthouse", &GenerateOptions::default(), &cancel)
//!         .await?;
//!     println!("Generated {} assets", result.report.succeeded);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod llm;
pub mod openai;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod story;
pub mod tasks;
pub mod transcription;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, ScenecastError, ServiceError};
