//! Browser-automation generation client.
//!
//! The browser itself is controlled by a local automation driver. This module
//! owns the login session of one account profile, reopens it when the
//! service logs the profile out, and classifies the driver's free-text error
//! messages into service failures.

use super::{GenerationClient, GenerationKind, GenerationRequest, GenerationResult};
use crate::config::{AccountSettings, BrowserSettings};
use crate::error::{Result, ScenecastError, ServiceError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// One generation job handed to the automation driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverJob {
    pub kind: GenerationKind,
    pub prompt: String,
    pub references: Vec<String>,
    pub output_path: String,
}

impl From<&GenerationRequest> for DriverJob {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            kind: request.kind,
            prompt: request.prompt.clone(),
            references: request
                .references
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            output_path: request.output_path.display().to_string(),
        }
    }
}

/// Outcome of a driver job as reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverJobResult {
    pub ok: bool,
    /// Local path the driver saved the asset to.
    #[serde(default)]
    pub asset_path: Option<String>,
    /// Remote URL of the asset, when known.
    #[serde(default)]
    pub asset_url: Option<String>,
    /// Error text shown by the service or the driver.
    #[serde(default)]
    pub error: Option<String>,
}

/// Boundary to the browser-automation collaborator.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Open a browser session on `profile` and return its handle.
    async fn open_session(
        &self,
        profile: &str,
        headless: bool,
    ) -> std::result::Result<String, ServiceError>;

    /// Run one generation job inside an open session.
    async fn run_job(
        &self,
        session: &str,
        job: &DriverJob,
    ) -> std::result::Result<DriverJobResult, ServiceError>;

    /// Close a session. Closing an unknown session is not an error.
    async fn close_session(&self, session: &str) -> std::result::Result<(), ServiceError>;
}

fn session_expired_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)session (expired|not found)|token expired|login required|signed out|unauthenticated")
            .expect("session expiry pattern is valid")
    })
}

fn classifier() -> &'static [(Regex, fn(String) -> ServiceError)] {
    static PATTERNS: OnceLock<Vec<(Regex, fn(String) -> ServiceError)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(&str, fn(String) -> ServiceError); 4] = [
            (
                r"(?i)\b403\b|suspended|banned|account (disabled|locked)",
                ServiceError::AccountSuspended,
            ),
            (
                r"(?i)\b429\b|quota|rate.?limit|too many requests|limit reached",
                ServiceError::RateLimited,
            ),
            (
                r"(?i)captcha|recaptcha|connection (refused|reset|closed)|browser (crashed|disconnected)|timed? ?out",
                ServiceError::TransientFault,
            ),
            (
                r"(?i)polic(y|ies)|unsafe|blocked|content filter|not allowed|prohibited",
                ServiceError::Rejected,
            ),
        ];
        table
            .into_iter()
            .map(|(pattern, variant)| {
                let re = Regex::new(pattern).expect("automation error pattern is valid");
                (re, variant)
            })
            .collect()
    })
}

/// Classify automation error text. Unrecognized errors are transient.
pub fn classify_automation_error(text: &str) -> ServiceError {
    classifier()
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, variant)| variant(text.to_string()))
        .unwrap_or_else(|| ServiceError::TransientFault(text.to_string()))
}

fn is_session_expired(text: &str) -> bool {
    session_expired_pattern().is_match(text)
}

/// Generation client that drives a logged-in browser profile.
pub struct BrowserGenerationClient {
    driver: Arc<dyn AutomationDriver>,
    account_id: String,
    profile: String,
    headless: bool,
    max_session_restarts: u32,
    session: Mutex<Option<String>>,
}

impl BrowserGenerationClient {
    /// Create a client for the browser profile of `account`.
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        browser: &BrowserSettings,
        account: &AccountSettings,
    ) -> Result<Self> {
        let profile = account.profile.clone().filter(|p| !p.is_empty()).ok_or_else(|| {
            ScenecastError::Config(format!("Account '{}' has no browser profile", account.id))
        })?;

        Ok(Self {
            driver,
            account_id: account.id.clone(),
            profile: shellexpand::tilde(&profile).to_string(),
            headless: browser.headless,
            max_session_restarts: browser.max_session_restarts,
            session: Mutex::new(None),
        })
    }

    async fn current_session(&self) -> std::result::Result<String, ServiceError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        info!(account = %self.account_id, "Opening browser session");
        let session = self.driver.open_session(&self.profile, self.headless).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn drop_session(&self, expired: &str) {
        let mut guard = self.session.lock().await;
        if guard.as_deref() == Some(expired) {
            if let Err(e) = self.driver.close_session(expired).await {
                debug!("Closing expired session failed: {}", e);
            }
            *guard = None;
        }
    }
}

#[async_trait]
impl GenerationClient for BrowserGenerationClient {
    fn name(&self) -> &str {
        "browser"
    }

    #[instrument(skip(self, request), fields(task = %request.task_id, account = %self.account_id))]
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, ServiceError> {
        let job = DriverJob::from(request);
        let mut restarts = 0;

        loop {
            let session = self.current_session().await?;
            let result = self.driver.run_job(&session, &job).await?;

            if result.ok {
                let local_path = result
                    .asset_path
                    .map(PathBuf::from)
                    .or_else(|| Some(request.output_path.clone()));
                let uri = result
                    .asset_url
                    .or_else(|| local_path.as_ref().map(|p| p.display().to_string()))
                    .unwrap_or_default();
                return Ok(GenerationResult { uri, local_path });
            }

            let error = result
                .error
                .unwrap_or_else(|| "automation job failed without an error message".to_string());

            if !is_session_expired(&error) {
                return Err(classify_automation_error(&error));
            }

            self.drop_session(&session).await;
            if restarts >= self.max_session_restarts {
                return Err(ServiceError::AccountSuspended(format!(
                    "login could not be restored after {} restart(s): {}",
                    restarts, error
                )));
            }
            restarts += 1;
            warn!(account = %self.account_id, "Browser session expired, reopening ({})", restarts);
        }
    }
}

/// Automation driver reached over HTTP on a local sidecar.
pub struct HttpAutomationDriver {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct OpenSessionBody<'a> {
    profile: &'a str,
    headless: bool,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

impl HttpAutomationDriver {
    pub fn new(driver_url: &str) -> Result<Self> {
        let base_url = Url::parse(driver_url).map_err(|e| {
            ScenecastError::Config(format!("Invalid generation.browser.driver_url '{}': {}", driver_url, e))
        })?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::Rejected(format!("invalid driver endpoint {}: {}", path, e)))
    }
}

fn driver_unreachable(err: reqwest::Error) -> ServiceError {
    ServiceError::TransientFault(format!("automation driver unreachable: {}", err))
}

#[async_trait]
impl AutomationDriver for HttpAutomationDriver {
    async fn open_session(
        &self,
        profile: &str,
        headless: bool,
    ) -> std::result::Result<String, ServiceError> {
        let response = self
            .client
            .post(self.endpoint("sessions")?)
            .json(&OpenSessionBody { profile, headless })
            .send()
            .await
            .map_err(driver_unreachable)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_automation_error(&body));
        }
        let opened: OpenSessionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::TransientFault(format!("malformed driver response: {}", e)))?;
        Ok(opened.session_id)
    }

    async fn run_job(
        &self,
        session: &str,
        job: &DriverJob,
    ) -> std::result::Result<DriverJobResult, ServiceError> {
        let response = self
            .client
            .post(self.endpoint(&format!("sessions/{}/jobs", session))?)
            .json(job)
            .send()
            .await
            .map_err(driver_unreachable)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(DriverJobResult {
                ok: false,
                error: Some(format!("session not found: {}", session)),
                ..Default::default()
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(DriverJobResult {
                ok: false,
                error: Some(format!("driver returned {}: {}", status, body)),
                ..Default::default()
            });
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::TransientFault(format!("malformed driver response: {}", e)))
    }

    async fn close_session(&self, session: &str) -> std::result::Result<(), ServiceError> {
        let response = self
            .client
            .delete(self.endpoint(&format!("sessions/{}", session))?)
            .send()
            .await
            .map_err(driver_unreachable)?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ServiceError::TransientFault(format!("driver returned {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Driver that replays scripted job results.
    #[derive(Default)]
    struct FakeDriver {
        results: std::sync::Mutex<VecDeque<DriverJobResult>>,
        opened: std::sync::Mutex<Vec<String>>,
        closed: std::sync::Mutex<Vec<String>>,
    }

    impl FakeDriver {
        fn with_results(results: Vec<DriverJobResult>) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl AutomationDriver for FakeDriver {
        async fn open_session(
            &self,
            profile: &str,
            _headless: bool,
        ) -> std::result::Result<String, ServiceError> {
            let mut opened = self.opened.lock().unwrap();
            let id = format!("{}#{}", profile, opened.len() + 1);
            opened.push(id.clone());
            Ok(id)
        }

        async fn run_job(
            &self,
            _session: &str,
            _job: &DriverJob,
        ) -> std::result::Result<DriverJobResult, ServiceError> {
            Ok(self.results.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn close_session(&self, session: &str) -> std::result::Result<(), ServiceError> {
            self.closed.lock().unwrap().push(session.to_string());
            Ok(())
        }
    }

    fn failure(error: &str) -> DriverJobResult {
        DriverJobResult {
            ok: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    fn success(path: &str) -> DriverJobResult {
        DriverJobResult {
            ok: true,
            asset_path: Some(path.to_string()),
            ..Default::default()
        }
    }

    fn client(driver: Arc<FakeDriver>, restarts: u32) -> BrowserGenerationClient {
        let browser = BrowserSettings {
            max_session_restarts: restarts,
            ..Default::default()
        };
        let account = AccountSettings {
            id: "acct-a".to_string(),
            profile: Some("/profiles/a".to_string()),
            ..Default::default()
        };
        BrowserGenerationClient::new(driver, &browser, &account).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            task_id: "s002-image".to_string(),
            kind: GenerationKind::Image,
            prompt: "storm over the cliffs".to_string(),
            references: vec![PathBuf::from("/runs/r1/nv/nv1.png")],
            output_path: PathBuf::from("/runs/r1/img/s002.png"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify_automation_error("reCAPTCHA challenge shown"),
            ServiceError::TransientFault(_)
        ));
        assert!(matches!(
            classify_automation_error("Daily quota exceeded for this account"),
            ServiceError::RateLimited(_)
        ));
        assert!(matches!(
            classify_automation_error("Prompt blocked by safety policy"),
            ServiceError::Rejected(_)
        ));
        assert!(matches!(
            classify_automation_error("HTTP 403 from backend"),
            ServiceError::AccountSuspended(_)
        ));
        assert!(matches!(
            classify_automation_error("something odd happened"),
            ServiceError::TransientFault(_)
        ));
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(classifier().len(), 4);
        assert!(is_session_expired("Session expired at 12:00"));
        assert!(!is_session_expired("render finished"));
    }

    #[tokio::test]
    async fn test_session_reopened_after_expiry() {
        let driver = FakeDriver::with_results(vec![
            failure("Token expired, please sign in"),
            success("/runs/r1/img/s002.png"),
        ]);
        let client = client(driver.clone(), 2);

        let result = client.generate(&request()).await.unwrap();
        assert_eq!(result.local_path, Some(PathBuf::from("/runs/r1/img/s002.png")));
        assert_eq!(driver.opened.lock().unwrap().len(), 2);
        assert_eq!(driver.closed.lock().unwrap().as_slice(), ["/profiles/a#1"]);
    }

    #[tokio::test]
    async fn test_login_lost_kills_account() {
        let driver = FakeDriver::with_results(vec![
            failure("session expired"),
            failure("session expired"),
        ]);
        let client = client(driver, 1);

        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::AccountSuspended(_)));
    }

    #[tokio::test]
    async fn test_session_is_reused() {
        let driver = FakeDriver::with_results(vec![success("/a.png"), success("/b.png")]);
        let client = client(driver.clone(), 0);

        client.generate(&request()).await.unwrap();
        client.generate(&request()).await.unwrap();
        assert_eq!(driver.opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_job_carries_references() {
        let job = DriverJob::from(&request());
        assert_eq!(job.references, vec!["/runs/r1/nv/nv1.png".to_string()]);
        assert_eq!(job.kind, GenerationKind::Image);
    }
}
