use anyhow::{Context, Result};
use bytes::Bytes;
use keepsake_core::capsule::{CreateCapsuleResponse, GrantWriterRequest};
use keepsake_core::upload::{
    BeginUploadRequest, BeginUploadResponse, FinishUploadRequest, FinishUploadResponse,
    PutChunkResponse, UploadStatusResponse,
};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const TIER_HEADER: &str = "x-keepsake-tier";

/// A non-success response from the server, decoded from its JSON error body.
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}) {code}: {message}")]
pub struct ApiFailure {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ApiFailure {
    async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Self {
                status,
                code: err.code,
                message: err.message,
            },
            Err(_) => Self {
                status,
                code: "unknown".to_string(),
                message: body,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub max_chunk_size: u64,
    pub default_chunk_size: u64,
    pub max_chunk_count: u32,
    pub inline_max_bytes: u64,
    pub internal_max_bytes: u64,
    pub external_tier: bool,
    pub api_version: String,
}

/// Bytes of a resolved asset plus what the server said about them.
#[derive(Clone, Debug)]
pub struct FetchedAsset {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub tier: Option<String>,
    /// SHA-256 hex from the `ETag` header.
    pub sha256: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    /// Send with bearer auth, retrying transport errors and 5xx responses.
    async fn send<F>(&self, make_request: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match make_request().bearer_auth(&self.token).send().await {
                Ok(response) if response.status().is_server_error() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_secs(1 << (attempt - 1)); // 1s, 2s, 4s
                    tracing::warn!(
                        status = %response.status(),
                        delay_secs = delay.as_secs(),
                        "Server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => return Err(ApiFailure::from_response(response).await.into()),
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(error = %e, delay_secs = delay.as_secs(), "Request error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send_json<T, F>(&self, make_request: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let response = self.send(make_request).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesResponse> {
        let url = self.url("/v1/capabilities")?;
        self.send_json(|| self.http.get(url.clone())).await
    }

    pub async fn create_capsule(&self) -> Result<CreateCapsuleResponse> {
        let url = self.url("/v1/capsules")?;
        self.send_json(|| self.http.post(url.clone())).await
    }

    pub async fn grant_writer(&self, capsule_id: &str, principal: &str) -> Result<()> {
        let url = self.url(&format!("/v1/capsules/{capsule_id}/writers"))?;
        let req = GrantWriterRequest {
            principal: principal.to_string(),
        };
        self.send(|| self.http.post(url.clone()).json(&req)).await?;
        Ok(())
    }

    pub async fn begin_upload(&self, req: &BeginUploadRequest) -> Result<BeginUploadResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(|| self.http.post(url.clone()).json(req)).await
    }

    pub async fn upload_status(&self, session_id: &str) -> Result<UploadStatusResponse> {
        let url = self.url(&format!("/v1/uploads/{session_id}"))?;
        self.send_json(|| self.http.get(url.clone())).await
    }

    /// PUT raw chunk bytes. The body is sent as-is, never text-encoded.
    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<PutChunkResponse> {
        let url = self.url(&format!("/v1/uploads/{session_id}/chunks/{chunk_index}"))?;
        self.send_json(|| {
            self.http
                .put(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone())
        })
        .await
    }

    pub async fn finish_upload(
        &self,
        session_id: &str,
        req: &FinishUploadRequest,
    ) -> Result<FinishUploadResponse> {
        let url = self.url(&format!("/v1/uploads/{session_id}/finish"))?;
        self.send_json(|| self.http.post(url.clone()).json(req)).await
    }

    pub async fn abort_upload(&self, session_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/uploads/{session_id}"))?;
        self.send(|| self.http.delete(url.clone())).await?;
        Ok(())
    }

    /// GET a variant of a memory, or its inline copy only when `inline` is set.
    pub async fn fetch_asset(
        &self,
        memory_id: &str,
        variant: &str,
        inline: bool,
    ) -> Result<FetchedAsset> {
        let path = if inline {
            format!("/v1/memories/{memory_id}/assets/{variant}/inline")
        } else {
            format!("/v1/memories/{memory_id}/assets/{variant}")
        };
        let url = self.url(&path)?;
        let response = self.send(|| self.http.get(url.clone())).await?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let tier = header(reqwest::header::HeaderName::from_static(TIER_HEADER));
        let sha256 = header(reqwest::header::ETAG).map(|etag| etag.trim_matches('"').to_string());

        Ok(FetchedAsset {
            data: response.bytes().await?,
            content_type,
            tier,
            sha256,
        })
    }
}
