//! Configuration module for Scenecast.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{Prompts, StepPrompt, StoryPrompts};
pub use settings::{
    AccountSettings, ApiSettings, BackoffSettings, BrowserSettings, GeneralSettings,
    GenerationBackend, GenerationSettings, PipelineSettings, PromptSettings, RateLimitSettings,
    Settings, StoreSettings,
};
