//! Text extraction: raw document bytes → plain text.
//!
//! Two Google services are supported and chosen by configuration
//! ([`ExtractionBackend`]), never by parallel code paths:
//!
//! * **Cloud Vision** `DOCUMENT_TEXT_DETECTION`. Images go to
//!   `images:annotate`; PDF/TIFF/GIF go to `files:annotate`, which reads
//!   multi-page files inline (first five pages).
//! * **Document AI** `processors/{id}:process`, which returns the whole
//!   document text in one field.
//!
//! Both take the file inline as base64 ([`crate::pipeline::encode`]).
//! Document AI bearer tokens come from [`crate::pipeline::auth`], which mints
//! and refreshes them when a service-account key is configured.
//! An answer without text is returned as an empty string; deciding that an
//! empty extraction is fatal belongs to the handler.

use crate::config::ExtractionBackend;
use crate::error::AnalysisError;
use crate::pipeline::auth::TokenSource;
use crate::pipeline::encode::{encode_document, is_paged_mime};
use crate::pipeline::storage::error_reason;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const VISION_ENDPOINT: &str = "https://vision.googleapis.com";
const FEATURE: &str = "DOCUMENT_TEXT_DETECTION";

/// Converts a document into text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract all text from `bytes`, declared as `mime_type`.
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, AnalysisError>;
}

/// [`TextExtractor`] for the configured Google backend.
pub struct ExtractorClient {
    client: Client,
    backend: ExtractionBackend,
    tokens: Option<TokenSource>,
    timeout: Duration,
}

impl ExtractorClient {
    pub fn new(backend: ExtractionBackend, timeout_secs: u64) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .build()
            .map_err(|e| AnalysisError::Internal(format!("HTTP client: {e}")))?;
        let timeout = Duration::from_secs(timeout_secs);
        let tokens = match &backend {
            ExtractionBackend::DocumentAi { credentials, .. } => Some(TokenSource::new(
                credentials.clone(),
                client.clone(),
                timeout,
            )),
            ExtractionBackend::Vision { .. } => None,
        };
        Ok(Self {
            client,
            backend,
            tokens,
            timeout,
        })
    }

    async fn post(&self, request: reqwest::RequestBuilder, body: &Value) -> Result<Value, AnalysisError> {
        let response = request
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout {
                        stage: "Text extraction".into(),
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    AnalysisError::ExtractionFailed {
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(AnalysisError::ExtractionFailed {
                reason: error_reason(response).await,
            });
        }

        response
            .json()
            .await
            .map_err(|e| AnalysisError::ExtractionFailed {
                reason: format!("invalid response body: {e}"),
            })
    }
}

#[async_trait]
impl TextExtractor for ExtractorClient {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, AnalysisError> {
        let content = encode_document(bytes);
        info!(
            "Extracting text with {} ({} bytes, {})",
            self.backend.name(),
            bytes.len(),
            mime_type
        );

        let text = match &self.backend {
            ExtractionBackend::Vision { api_key, endpoint } => {
                let base = endpoint.as_deref().unwrap_or(VISION_ENDPOINT);
                let paged = is_paged_mime(mime_type);
                let url = if paged {
                    format!("{base}/v1/files:annotate")
                } else {
                    format!("{base}/v1/images:annotate")
                };
                let body = vision_request(&content, mime_type, paged);
                let request = self.client.post(url).query(&[("key", api_key.as_str())]);
                let response = self.post(request, &body).await?;
                if paged {
                    text_from_vision_files(&response)?
                } else {
                    text_from_vision_image(&response)?
                }
            }
            ExtractionBackend::DocumentAi {
                project_id,
                location,
                processor_id,
                endpoint,
                ..
            } => {
                let base = endpoint
                    .clone()
                    .unwrap_or_else(|| format!("https://{location}-documentai.googleapis.com"));
                let url = format!(
                    "{base}/v1/projects/{project_id}/locations/{location}/processors/{processor_id}:process"
                );
                let body = document_ai_request(&content, mime_type);
                let tokens = self.tokens.as_ref().ok_or_else(|| {
                    AnalysisError::Internal("Document AI backend has no token source".into())
                })?;
                let token = tokens.token().await?;
                let request = self.client.post(url).bearer_auth(token);
                let response = self.post(request, &body).await?;
                text_from_document_ai(&response)?
            }
        };

        debug!("Extracted {} chars", text.chars().count());
        Ok(text)
    }
}

// ── Request bodies ───────────────────────────────────────────────────────

fn vision_request(content: &str, mime_type: &str, paged: bool) -> Value {
    if paged {
        json!({
            "requests": [{
                "inputConfig": { "content": content, "mimeType": mime_type },
                "features": [{ "type": FEATURE }]
            }]
        })
    } else {
        json!({
            "requests": [{
                "image": { "content": content },
                "features": [{ "type": FEATURE }]
            }]
        })
    }
}

fn document_ai_request(content: &str, mime_type: &str) -> Value {
    json!({
        "rawDocument": { "content": content, "mimeType": mime_type }
    })
}

// ── Response parsing ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    #[serde(default)]
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateFileResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
    #[serde(default)]
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse<T> {
    #[serde(default = "Vec::new")]
    responses: Vec<T>,
}

fn malformed(e: serde_json::Error) -> AnalysisError {
    AnalysisError::ExtractionFailed {
        reason: format!("unexpected response shape: {e}"),
    }
}

fn service_error(status: &Option<Status>) -> Result<(), AnalysisError> {
    match status {
        Some(s) if !s.message.is_empty() => Err(AnalysisError::ExtractionFailed {
            reason: s.message.clone(),
        }),
        _ => Ok(()),
    }
}

/// Text of the first `images:annotate` response.
fn text_from_vision_image(body: &Value) -> Result<String, AnalysisError> {
    let batch: BatchResponse<AnnotateImageResponse> =
        serde_json::from_value(body.clone()).map_err(malformed)?;
    let Some(first) = batch.responses.into_iter().next() else {
        warn!("Vision response carried no results");
        return Ok(String::new());
    };
    service_error(&first.error)?;
    Ok(first.full_text_annotation.map(|a| a.text).unwrap_or_default())
}

/// Text of every page of the first `files:annotate` response, in page order.
fn text_from_vision_files(body: &Value) -> Result<String, AnalysisError> {
    let batch: BatchResponse<AnnotateFileResponse> =
        serde_json::from_value(body.clone()).map_err(malformed)?;
    let Some(file) = batch.responses.into_iter().next() else {
        warn!("Vision response carried no results");
        return Ok(String::new());
    };
    service_error(&file.error)?;

    let mut pages = Vec::with_capacity(file.responses.len());
    for page in file.responses {
        service_error(&page.error)?;
        if let Some(a) = page.full_text_annotation {
            if !a.text.is_empty() {
                pages.push(a.text);
            }
        }
    }
    Ok(pages.join("\n"))
}

/// `document.text` of a Document AI `process` response.
fn text_from_document_ai(body: &Value) -> Result<String, AnalysisError> {
    Ok(body
        .pointer("/document/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
