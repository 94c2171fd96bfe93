//! Structured HTTP API generation client.

use super::{GenerationClient, GenerationKind, GenerationRequest, GenerationResult};
use crate::config::{AccountSettings, ApiSettings};
use crate::error::{Result, ScenecastError, ServiceError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Generation client for the structured HTTP API.
///
/// Requests are authenticated with the account's bearer key. Generated assets
/// are downloaded to the request's output path.
pub struct ApiGenerationClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    account_id: String,
    image_model: String,
    video_model: String,
    aspect_ratio: String,
}

#[derive(Debug, Serialize)]
struct CreateAssetBody<'a> {
    model: &'a str,
    prompt: &'a str,
    aspect_ratio: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reference_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

impl ApiGenerationClient {
    /// Create a client bound to `account`.
    pub fn new(api: &ApiSettings, account: &AccountSettings, timeout: Duration) -> Result<Self> {
        if api.base_url.trim().is_empty() {
            return Err(ScenecastError::Config(
                "generation.api.base_url is not set".to_string(),
            ));
        }
        let mut base_url = Url::parse(&api.base_url).map_err(|e| {
            ScenecastError::Config(format!("Invalid generation.api.base_url '{}': {}", api.base_url, e))
        })?;
        // Url::join replaces the last path segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let api_key = account.resolve_api_key().ok_or_else(|| {
            ScenecastError::Config(format!("Account '{}' has no API key", account.id))
        })?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            account_id: account.id.clone(),
            image_model: api.image_model.clone(),
            video_model: api.video_model.clone(),
            aspect_ratio: api.aspect_ratio.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::Rejected(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn upload_reference(&self, path: &std::path::Path) -> std::result::Result<String, ServiceError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ServiceError::Rejected(format!("reference image {} unreadable: {}", path.display(), e))
        })?;

        let response = self
            .client
            .post(self.endpoint("v1/uploads")?)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let upload: UploadResponse = read_json(response).await?;
        Ok(upload.id)
    }

    async fn download(
        &self,
        url: &str,
        path: &std::path::Path,
    ) -> std::result::Result<(), ServiceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let bytes = response.bytes().await.map_err(|e| classify_transport(&e))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::TransientFault(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| ServiceError::TransientFault(format!("cannot write {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl GenerationClient for ApiGenerationClient {
    fn name(&self) -> &str {
        "api"
    }

    #[instrument(skip(self, request), fields(task = %request.task_id, account = %self.account_id))]
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, ServiceError> {
        let mut reference_ids = Vec::with_capacity(request.references.len());
        for path in &request.references {
            reference_ids.push(self.upload_reference(path).await?);
        }

        let (path, model) = match request.kind {
            GenerationKind::Image => ("v1/images", self.image_model.as_str()),
            GenerationKind::Video => ("v1/videos", self.video_model.as_str()),
        };
        let body = CreateAssetBody {
            model,
            prompt: &request.prompt,
            aspect_ratio: &self.aspect_ratio,
            reference_ids,
        };

        debug!(kind = %request.kind, "Sending generation request");
        let response = self
            .client
            .post(self.endpoint(path)?)
            .bearer_auth(&self.api_key)
            .header("x-request-id", uuid::Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let asset: AssetResponse = read_json(response).await?;
        self.download(&asset.url, &request.output_path).await?;
        debug!(path = %request.output_path.display(), "Asset downloaded");

        Ok(GenerationResult {
            uri: asset.url,
            local_path: Some(request.output_path.clone()),
        })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> std::result::Result<T, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    response
        .json()
        .await
        .map_err(|e| ServiceError::TransientFault(format!("malformed response: {}", e)))
}

/// Map an HTTP error status to a service failure.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ServiceError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::AccountSuspended(message),
        StatusCode::REQUEST_TIMEOUT => ServiceError::TransientFault(message),
        s if s.is_server_error() => ServiceError::TransientFault(message),
        _ => ServiceError::Rejected(message),
    }
}

/// Map a transport failure to a service failure. All of them are retryable.
fn classify_transport(err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::TransientFault(format!("request timed out: {}", err))
    } else if err.is_connect() {
        ServiceError::TransientFault(format!("connection failed: {}", err))
    } else {
        ServiceError::TransientFault(err.to_string())
    }
}
