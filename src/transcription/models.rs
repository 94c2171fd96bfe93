//! Data models for caption transcripts.

use serde::{Deserialize, Serialize};

/// A complete caption transcript: the seed of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Identifier of the narration this transcript belongs to.
    pub source_id: String,
    /// Individual caption segments with timestamps.
    pub segments: Vec<TranscriptSegment>,
    /// Full transcript text (concatenated segments).
    pub full_text: String,
    /// Total duration in seconds.
    pub duration_seconds: f64,
}

impl Transcript {
    /// Create a new transcript from segments.
    pub fn new(source_id: String, segments: Vec<TranscriptSegment>) -> Self {
        let full_text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let duration_seconds = segments
            .last()
            .map(|s| s.end_seconds)
            .unwrap_or(0.0);

        Self {
            source_id,
            segments,
            full_text,
            duration_seconds,
        }
    }

    /// Format the transcript with timestamps, one caption per line.
    pub fn format_with_timestamps(&self) -> String {
        self.segments
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. [{} - {}] {}",
                i + 1,
                format_timestamp(s.start_seconds),
                format_timestamp(s.end_seconds),
                s.text
            ))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A single caption with timestamp information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds.
    #[serde(alias = "start")]
    pub start_seconds: f64,
    /// End time in seconds.
    #[serde(alias = "end")]
    pub end_seconds: f64,
    /// Caption text.
    pub text: String,
}

impl TranscriptSegment {
    /// Create a new transcript segment.
    pub fn new(start_seconds: f64, end_seconds: f64, text: String) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text,
        }
    }

    /// Duration of this segment in seconds.
    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// Format seconds as MM:SS or HH:MM:SS.
pub fn format_timestamp(seconds: f64) -> String {
    let total_seconds = seconds as u32;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
