//! Execution of a single pipeline step.

use super::steps::{build_prompt, correction_hint, parse_step_output};
use super::StepId;
use crate::config::{PipelineSettings, Prompts};
use crate::error::{Result, ScenecastError};
use crate::llm::TextGenerator;
use crate::story::{validate_output, StepOutput, StoryModel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Retry bounds of a step.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Generation attempts before the step fails.
    pub max_attempts: u32,
    /// Delay before retrying after a retryable service error.
    pub retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_step_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

/// Runs one step: prompt, text generation, parsing and validation.
///
/// The executor never mutates the model; merging the returned rows is the
/// coordinator's job.
pub struct StepExecutor {
    generator: Arc<dyn TextGenerator>,
    prompts: Prompts,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>, prompts: Prompts, config: ExecutorConfig) -> Self {
        Self {
            generator,
            prompts,
            config,
        }
    }

    /// Produce validated rows for `step` from `model`.
    #[instrument(skip(self, model), fields(run_id = %model.run_id, step = %step))]
    pub async fn run_step(&self, step: StepId, model: &StoryModel) -> Result<StepOutput> {
        model.check_prerequisite(step)?;

        let base = build_prompt(&self.prompts, step, model);
        let max_attempts = self.config.max_attempts.max(1);
        let mut reason = String::new();
        let mut raw_response: Option<String> = None;
        let mut correction: Option<String> = None;

        for attempt in 1..=max_attempts {
            let mut request = base.clone();
            if let Some(error) = &correction {
                request.user.push_str(&correction_hint(&self.prompts, error));
            }

            debug!(attempt, "Requesting step output");
            let response = match self.generator.complete(&request).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    warn!(attempt, "Text generation failed: {}", e);
                    reason = e.to_string();
                    if attempt < max_attempts && !self.config.retry_delay.is_zero() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    continue;
                }
                Err(e) => {
                    return Err(ScenecastError::StepGenerationFailed {
                        step,
                        attempts: attempt,
                        reason: e.to_string(),
                        raw_response,
                    });
                }
            };

            let parsed = parse_step_output(step, &response)
                .and_then(|output| validate_output(model, &output).map(|_| output));
            match parsed {
                Ok(output) => {
                    info!(rows = output.row_count(), attempt, "Step output accepted");
                    return Ok(output);
                }
                Err(e) => {
                    warn!(attempt, "Step output unusable: {}", e);
                    reason = e.to_string();
                    correction = Some(reason.clone());
                    raw_response = Some(response);
                }
            }
        }

        Err(ScenecastError::StepGenerationFailed {
            step,
            attempts: max_attempts,
            reason,
            raw_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::testing::{canned_response, complete_model, seed_model, ScriptedTextGenerator};

    fn executor(generator: Arc<ScriptedTextGenerator>, max_attempts: u32) -> StepExecutor {
        StepExecutor::new(
            generator,
            Prompts::default(),
            ExecutorConfig {
                max_attempts,
                retry_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_missing_prerequisite_skips_generator() {
        let generator = Arc::new(ScriptedTextGenerator::new());
        let result = executor(generator.clone(), 3)
            .run_step(StepId::Locations, &seed_model("run"))
            .await;

        assert!(matches!(result, Err(ScenecastError::PrerequisiteMissing { .. })));
        assert_eq!(generator.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_output_retried_with_correction() {
        let full = complete_model("run", 2);
        let mut model = full.clone();
        model.scenes.clear();

        let generator = Arc::new(ScriptedTextGenerator::for_model(&full));
        let broken = canned_response(&full, StepId::ScenePrompts).replace("\"nv1\"", "\"nv9\"");
        generator.push("scene_prompts", Ok(broken));

        let output = executor(generator.clone(), 3)
            .run_step(StepId::ScenePrompts, &model)
            .await
            .unwrap();

        assert_eq!(output.row_count(), 2);
        assert_eq!(generator.calls("scene_prompts"), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_keep_raw_response() {
        let generator = Arc::new(ScriptedTextGenerator::new());
        generator.set_default("analysis", "I would rather not.".to_string());

        let err = executor(generator.clone(), 2)
            .run_step(StepId::Analysis, &seed_model("run"))
            .await
            .unwrap_err();

        match err {
            ScenecastError::StepGenerationFailed {
                step,
                attempts,
                raw_response,
                ..
            } => {
                assert_eq!(step, StepId::Analysis);
                assert_eq!(attempts, 2);
                assert_eq!(raw_response.as_deref(), Some("I would rather not."));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(generator.calls("analysis"), 2);
    }

    #[tokio::test]
    async fn test_rejected_prompt_fails_immediately() {
        let generator = Arc::new(ScriptedTextGenerator::for_model(&complete_model("run", 1)));
        generator.push("analysis", Err(ServiceError::Rejected("content policy".to_string())));

        let err = executor(generator.clone(), 3)
            .run_step(StepId::Analysis, &seed_model("run"))
            .await
            .unwrap_err();

        assert!(matches!(err, ScenecastError::StepGenerationFailed { attempts: 1, .. }));
        assert_eq!(generator.calls("analysis"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let generator = Arc::new(ScriptedTextGenerator::for_model(&complete_model("run", 1)));
        generator.push("analysis", Err(ServiceError::RateLimited("429".to_string())));

        let output = executor(generator.clone(), 3)
            .run_step(StepId::Analysis, &seed_model("run"))
            .await
            .unwrap();

        assert_eq!(output.step(), StepId::Analysis);
        assert_eq!(generator.calls("analysis"), 2);
    }
}
