//! Pre-flight checks before expensive operations.
//!
//! Validates that credentials and accounts are configured before starting
//! operations that would otherwise fail midway.

use crate::config::{GenerationBackend, Settings};
use crate::error::{Result, ScenecastError};
use crate::openai::is_api_key_configured;

/// Requirements for different operations.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Story pipeline steps require the text generation API key.
    Pipeline,
    /// Asset generation requires usable accounts for the configured backend.
    Generate,
    /// Reading stored runs has no external requirements.
    Inspect,
}

/// Run pre-flight checks for the given operation.
///
/// Returns Ok(()) if all checks pass, or an error describing what's missing.
pub fn check(operation: Operation, settings: &Settings) -> Result<()> {
    match operation {
        Operation::Pipeline => check_api_key(),
        Operation::Generate => check_accounts(settings),
        Operation::Inspect => Ok(()),
    }
}

/// Check if OpenAI API key is configured.
fn check_api_key() -> Result<()> {
    if is_api_key_configured() {
        Ok(())
    } else {
        Err(ScenecastError::Config(
            "OPENAI_API_KEY not set. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        ))
    }
}

/// Check that every account can back a session of the configured backend.
fn check_accounts(settings: &Settings) -> Result<()> {
    if settings.accounts.is_empty() {
        return Err(ScenecastError::Config(
            "No generation accounts configured. Add an [[accounts]] section (see 'scenecast config path')."
                .to_string(),
        ));
    }

    let generation = &settings.generation;
    let mut problems = Vec::new();
    match generation.backend {
        GenerationBackend::Api => {
            if generation.api.base_url.trim().is_empty() {
                problems.push("generation.api.base_url is not set".to_string());
            }
            for account in &settings.accounts {
                if account.resolve_api_key().is_none() {
                    problems.push(format!("account '{}' has no API key", account.id));
                }
            }
        }
        GenerationBackend::Browser => {
            for account in &settings.accounts {
                if account.profile.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    problems.push(format!("account '{}' has no browser profile", account.id));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ScenecastError::Config(problems.join("; ")))
    }
}
