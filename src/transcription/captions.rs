//! Caption file loading.
//!
//! Transcription itself happens outside Scenecast; runs are seeded from the
//! caption files it produces. SubRip (`.srt`) and a JSON array of
//! `{start, end, text}` objects are accepted.

use super::{Transcript, TranscriptSegment};
use crate::error::{Result, ScenecastError};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, instrument};

/// Caption file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionFormat {
    Srt,
    Json,
}

impl std::str::FromStr for CaptionFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "srt" => Ok(CaptionFormat::Srt),
            "json" => Ok(CaptionFormat::Json),
            _ => Err(format!("Unknown caption format: {}", s)),
        }
    }
}

impl CaptionFormat {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse().ok())
    }
}

/// Load captions from a file, using the extension to pick the format.
#[instrument(fields(path = %path.display()))]
pub fn load_captions(path: &Path) -> Result<Transcript> {
    let format = CaptionFormat::from_path(path).ok_or_else(|| {
        ScenecastError::Captions(format!(
            "Cannot tell caption format of {:?} (expected .srt or .json)",
            path
        ))
    })?;

    let content = std::fs::read_to_string(path)?;
    let source_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("captions")
        .to_string();

    parse_captions(&source_id, &content, format)
}

/// Parse caption text in the given format.
pub fn parse_captions(source_id: &str, content: &str, format: CaptionFormat) -> Result<Transcript> {
    let segments = match format {
        CaptionFormat::Srt => parse_srt(content)?,
        CaptionFormat::Json => serde_json::from_str::<Vec<TranscriptSegment>>(content)?,
    };

    if segments.is_empty() {
        return Err(ScenecastError::Captions("No caption segments found".to_string()));
    }

    for (i, seg) in segments.iter().enumerate() {
        if seg.end_seconds < seg.start_seconds {
            return Err(ScenecastError::Captions(format!(
                "Caption {} ends before it starts ({} < {})",
                i + 1,
                seg.end_seconds,
                seg.start_seconds
            )));
        }
    }

    debug!("Parsed {} caption segments", segments.len());
    Ok(Transcript::new(source_id.to_string(), segments))
}

fn timing_regex() -> &'static Regex {
    static TIMING: OnceLock<Regex> = OnceLock::new();
    TIMING.get_or_init(|| {
        Regex::new(
            r"(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})",
        )
        .expect("caption timing pattern is valid")
    })
}

fn parse_srt(content: &str) -> Result<Vec<TranscriptSegment>> {
    let normalized = content.replace("\r\n", "\n");
    let mut segments = Vec::new();

    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let Some(timing_pos) = lines.iter().position(|l| l.contains("-->")) else {
            continue;
        };

        let caps = timing_regex().captures(lines[timing_pos]).ok_or_else(|| {
            ScenecastError::Captions(format!("Malformed timing line: {}", lines[timing_pos]))
        })?;

        let field = |i: usize| -> f64 { caps[i].parse::<f64>().unwrap_or(0.0) };
        let millis = |i: usize| -> f64 {
            // "5" in "00:00:01,5" means 500ms
            let raw = &caps[i];
            raw.parse::<f64>().unwrap_or(0.0) / 10f64.powi(raw.len() as i32)
        };

        let start = field(1) * 3600.0 + field(2) * 60.0 + field(3) + millis(4);
        let end = field(5) * 3600.0 + field(6) * 60.0 + field(7) + millis(8);
        let text = lines[timing_pos + 1..].join(" ");

        if text.is_empty() {
            continue;
        }

        segments.push(TranscriptSegment::new(start, end, text));
    }

    Ok(segments)
}
