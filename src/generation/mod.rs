//! Image and video generation services.
//!
//! A [`GenerationClient`] turns one prompt into one asset. Two variants exist:
//! the structured HTTP API ([`ApiGenerationClient`]) and browser automation
//! driven through a local driver ([`BrowserGenerationClient`]). Each client is
//! bound to a single account and is used by exactly one worker session.

mod api;
mod browser;

pub use api::ApiGenerationClient;
pub use browser::{
    classify_automation_error, AutomationDriver, BrowserGenerationClient, DriverJob,
    DriverJobResult, HttpAutomationDriver,
};

pub use crate::config::GenerationBackend;

use crate::config::{AccountSettings, GenerationSettings};
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of asset to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Image,
    Video,
}

impl GenerationKind {
    /// File extension of generated assets.
    pub fn extension(self) -> &'static str {
        match self {
            GenerationKind::Image => "png",
            GenerationKind::Video => "mp4",
        }
    }
}

impl std::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationKind::Image => write!(f, "image"),
            GenerationKind::Video => write!(f, "video"),
        }
    }
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Task the request belongs to (`s003-image`).
    pub task_id: String,
    pub kind: GenerationKind,
    pub prompt: String,
    /// Reference images (character portraits, location shots) to condition on.
    pub references: Vec<PathBuf>,
    /// Where the generated asset should be written.
    pub output_path: PathBuf,
}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Remote URI of the asset, as reported by the service.
    pub uri: String,
    /// Local copy of the asset, when it was downloaded.
    pub local_path: Option<PathBuf>,
}

impl GenerationResult {
    /// Reference stored on the story record: the local file when present.
    pub fn reference(&self) -> String {
        match &self.local_path {
            Some(path) => path.display().to_string(),
            None => self.uri.clone(),
        }
    }
}

/// Capability contract of an external image/video generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Generate one asset.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, ServiceError>;
}

/// Create the generation client for `account` according to the configured backend.
pub fn create_client(
    settings: &GenerationSettings,
    account: &AccountSettings,
) -> Result<Arc<dyn GenerationClient>> {
    match settings.backend {
        GenerationBackend::Api => {
            let client = ApiGenerationClient::new(&settings.api, account, settings.task_timeout())?;
            Ok(Arc::new(client))
        }
        GenerationBackend::Browser => {
            let driver = HttpAutomationDriver::new(&settings.browser.driver_url)?;
            let client =
                BrowserGenerationClient::new(Arc::new(driver), &settings.browser, account)?;
            Ok(Arc::new(client))
        }
    }
}
