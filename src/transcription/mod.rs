//! Caption transcripts for Scenecast.
//!
//! Speech-to-text runs outside this crate. This module holds the transcript
//! model that seeds a pipeline run and the loaders for the caption files the
//! transcription tools write.

mod captions;
mod models;

pub use captions::{load_captions, parse_captions, CaptionFormat};
pub use models::{format_timestamp, Transcript, TranscriptSegment};
