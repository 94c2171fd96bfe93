//! Configuration settings for Scenecast.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub pipeline: PipelineSettings,
    pub generation: GenerationSettings,
    pub store: StoreSettings,
    pub prompts: PromptSettings,
    /// Generation service accounts, one per worker session.
    pub accounts: Vec<AccountSettings>,
}


/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Directory generated assets are written to, one subdirectory per run.
    pub output_dir: String,
    /// Directory finished runs are exported to for assembly.
    pub visual_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.scenecast".to_string(),
            output_dir: "~/.scenecast/projects".to_string(),
            visual_dir: "~/.scenecast/visual".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Settings for the progressive generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Chat model used for every step.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Generation attempts per step before the step fails.
    pub max_step_attempts: u32,
    /// Delay before retrying a rate-limited or faulted step call.
    pub retry_delay_ms: u64,
    /// Consecutive failures of one step before the run is abandoned.
    pub max_step_failures: u32,
    /// Timeout for a single text-generation request.
    pub request_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4.1".to_string(),
            temperature: 0.4,
            max_step_attempts: 3,
            retry_delay_ms: 2000,
            max_step_failures: 3,
            request_timeout_secs: 300,
        }
    }
}

/// Generation service implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    /// Structured HTTP API (default).
    #[default]
    Api,
    /// Browser automation through a local driver.
    Browser,
}

impl std::str::FromStr for GenerationBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" | "http" => Ok(GenerationBackend::Api),
            "browser" | "chrome" => Ok(GenerationBackend::Browser),
            _ => Err(format!("Unknown generation backend: {}", s)),
        }
    }
}

impl std::fmt::Display for GenerationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationBackend::Api => write!(f, "api"),
            GenerationBackend::Browser => write!(f, "browser"),
        }
    }
}

/// Exponential backoff between task attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// When a session is put on cooldown for repeated rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Rate-limit hits inside the window that trigger a cooldown.
    pub threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_secs: 60,
            cooldown_secs: 120,
        }
    }
}

/// Structured API backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL of the generation API.
    pub base_url: String,
    pub image_model: String,
    pub video_model: String,
    /// Image aspect ratio requested for every asset.
    pub aspect_ratio: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            image_model: "imagen-4".to_string(),
            video_model: "veo-3".to_string(),
            aspect_ratio: "16:9".to_string(),
        }
    }
}

/// Browser-automation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// URL of the local automation driver.
    pub driver_url: String,
    pub headless: bool,
    /// Session reopen attempts after the login expires.
    pub max_session_restarts: u32,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            driver_url: "http://127.0.0.1:9515".to_string(),
            headless: false,
            max_session_restarts: 2,
        }
    }
}

/// Settings for the generation phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub backend: GenerationBackend,
    /// Number of worker sessions.
    pub workers: usize,
    /// Queue a video task for every scene.
    pub video: bool,
    /// Queue reference portraits for characters and locations.
    pub reference_images: bool,
    /// Attempts per task before it fails terminally.
    pub max_attempts: u32,
    /// Timeout for a single generation call.
    pub task_timeout_secs: u64,
    pub backoff: BackoffSettings,
    pub rate_limit: RateLimitSettings,
    pub api: ApiSettings,
    pub browser: BrowserSettings,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::Api,
            workers: 2,
            video: false,
            reference_images: false,
            max_attempts: 3,
            task_timeout_secs: 300,
            backoff: BackoffSettings::default(),
            rate_limit: RateLimitSettings::default(),
            api: ApiSettings::default(),
            browser: BrowserSettings::default(),
        }
    }
}

impl GenerationSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// A generation service account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    /// Account identity shown in logs and reports.
    pub id: String,
    /// API key, for the API backend.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Browser profile directory, for the browser backend.
    pub profile: Option<String>,
    /// Dispatch slots for sessions bound to this account.
    pub concurrency: usize,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            api_key: None,
            api_key_env: None,
            profile: None,
            concurrency: 1,
        }
    }
}

impl AccountSettings {
    /// API key from the config file or the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty())
            })
    }
}

/// Story model persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Path to the SQLite database holding run checkpoints.
    pub sqlite_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sqlite_path: "~/.scenecast/runs.db".to_string(),
        }
    }
}

/// Prompt customization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PromptSettings {
    /// Directory for custom prompts (overrides defaults).
    pub custom_dir: Option<String>,
    /// Custom variables available in all prompts as {{variable_name}}.
    pub variables: std::collections::HashMap<String, String>,
}


impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings to the default configuration file.
    pub fn save(&self) -> crate::error::Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ScenecastError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scenecast")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Directory assets of `run_id` are generated into.
    pub fn run_output_dir(&self, run_id: &str) -> PathBuf {
        Self::expand_path(&self.general.output_dir).join(run_id)
    }

    /// Get the expanded export directory path.
    pub fn visual_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.visual_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.store.sqlite_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [generation]
            backend = "browser"
            workers = 4

            [[accounts]]
            id = "acct-a"
            profile = "/profiles/a"

            [[accounts]]
            id = "acct-b"
            api_key_env = "SCENECAST_TEST_UNSET_KEY"
            "#,
        )
        .unwrap();

        assert_eq!(settings.generation.backend, GenerationBackend::Browser);
        assert_eq!(settings.generation.workers, 4);
        assert_eq!(settings.generation.max_attempts, 3);
        assert_eq!(settings.pipeline.max_step_attempts, 3);
        assert_eq!(settings.accounts.len(), 2);
        assert_eq!(settings.accounts[0].concurrency, 1);
        assert_eq!(settings.accounts[1].resolve_api_key(), None);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("chrome".parse::<GenerationBackend>().unwrap(), GenerationBackend::Browser);
        assert_eq!("API".parse::<GenerationBackend>().unwrap(), GenerationBackend::Api);
        assert!("carrier-pigeon".parse::<GenerationBackend>().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.generation.video = true;
        settings.accounts.push(AccountSettings {
            id: "main".to_string(),
            api_key: Some("key".to_string()),
            ..Default::default()
        });
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(Some(&path)).unwrap();
        assert!(loaded.generation.video);
        assert_eq!(loaded.accounts[0].resolve_api_key().as_deref(), Some("key"));
    }
}
