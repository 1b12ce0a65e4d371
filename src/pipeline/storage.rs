//! Storage collaborator: document rows, result rows and uploaded files.
//!
//! The pipeline talks to storage only through [`StorageClient`], so tests can
//! substitute an in-memory store. [`SupabaseStorage`] is the production
//! implementation: PostgREST for tables (`/rest/v1/{table}`) and the Storage
//! API for files (`/storage/v1/object/{bucket}/{path}`), both authenticated
//! with the service key sent as `apikey` and as a bearer token.

use crate::config::StorageConfig;
use crate::error::AnalysisError;
use crate::record::{DocumentRecord, FinancialAnalysisRecord, StatusUpdate};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, Url};
use std::time::Duration;
use tracing::{debug, info};

/// Operations the pipeline needs from the storage backend.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Load one document row by id.
    ///
    /// Returns [`AnalysisError::DocumentNotFound`] when no row matches.
    async fn get_document(&self, id: &str) -> Result<DocumentRecord, AnalysisError>;

    /// Apply column updates to one document row.
    async fn update_document(&self, id: &str, update: &StatusUpdate) -> Result<(), AnalysisError>;

    /// Download the raw bytes stored under `path` in the documents bucket.
    async fn download_blob(&self, path: &str) -> Result<Vec<u8>, AnalysisError>;

    /// Insert one financial analysis row.
    async fn insert_analysis(&self, record: &FinancialAnalysisRecord) -> Result<(), AnalysisError>;
}

/// [`StorageClient`] backed by a Supabase project.
pub struct SupabaseStorage {
    client: Client,
    base_url: Url,
    config: StorageConfig,
    call_timeout: Duration,
    download_timeout: Duration,
}

impl SupabaseStorage {
    /// Create a client for the project described by `config`.
    pub fn new(
        config: &StorageConfig,
        call_timeout_secs: u64,
        download_timeout_secs: u64,
    ) -> Result<Self, AnalysisError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| AnalysisError::InvalidConfig(format!("storage URL: {e}")))?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_key)
            .map_err(|_| AnalysisError::InvalidConfig("storage key is not a valid header".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|_| AnalysisError::InvalidConfig("storage key is not a valid header".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| AnalysisError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            config: config.clone(),
            call_timeout: Duration::from_secs(call_timeout_secs),
            download_timeout: Duration::from_secs(download_timeout_secs),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, AnalysisError> {
        join_segments(&self.base_url, ["rest", "v1", table])
    }

    async fn send(
        &self,
        operation: &str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, AnalysisError> {
        let response = request.timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout {
                    stage: format!("Storage {operation}"),
                    secs: timeout.as_secs(),
                }
            } else {
                AnalysisError::storage(operation, e)
            }
        })?;
        Ok(response)
    }
}

#[async_trait]
impl StorageClient for SupabaseStorage {
    async fn get_document(&self, id: &str) -> Result<DocumentRecord, AnalysisError> {
        let url = self.table_url(&self.config.documents_table)?;
        let request = self
            .client
            .get(url)
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())]);

        let response = self.send("select", request, self.call_timeout).await?;
        if !response.status().is_success() {
            return Err(AnalysisError::storage("select", error_reason(response).await));
        }

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AnalysisError::storage("select", e))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| AnalysisError::DocumentNotFound { id: id.to_string() })?;

        debug!("Loaded document row {}", id);
        serde_json::from_value(row)
            .map_err(|e| AnalysisError::storage("select", format!("unexpected row shape: {e}")))
    }

    async fn update_document(&self, id: &str, update: &StatusUpdate) -> Result<(), AnalysisError> {
        let url = self.table_url(&self.config.documents_table)?;
        let request = self
            .client
            .patch(url)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(update);

        let response = self.send("update", request, self.call_timeout).await?;
        if !response.status().is_success() {
            return Err(AnalysisError::storage("update", error_reason(response).await));
        }
        debug!("Document {} → {}", id, update.analysis_status);
        Ok(())
    }

    async fn download_blob(&self, path: &str) -> Result<Vec<u8>, AnalysisError> {
        let segments = ["storage", "v1", "object", self.config.bucket.as_str()]
            .into_iter()
            .chain(path.split('/').filter(|s| !s.is_empty()));
        let url = join_segments(&self.base_url, segments)?;
        info!("Downloading '{}' from bucket '{}'", path, self.config.bucket);

        let response = self
            .send("download", self.client.get(url), self.download_timeout)
            .await
            .map_err(|e| match e {
                AnalysisError::Storage { reason, .. } => AnalysisError::DownloadFailed {
                    path: path.to_string(),
                    reason,
                },
                other => other,
            })?;

        if !response.status().is_success() {
            return Err(AnalysisError::DownloadFailed {
                path: path.to_string(),
                reason: error_reason(response).await,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalysisError::DownloadFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }

    async fn insert_analysis(&self, record: &FinancialAnalysisRecord) -> Result<(), AnalysisError> {
        let url = self.table_url(&self.config.results_table)?;
        let request = self
            .client
            .post(url)
            .header("Prefer", "return=minimal")
            .json(record);

        let response = self.send("insert", request, self.call_timeout).await?;
        if !response.status().is_success() {
            return Err(AnalysisError::storage("insert", error_reason(response).await));
        }
        debug!("Inserted analysis row for document {}", record.document_id);
        Ok(())
    }
}

/// Append path segments to `base`, percent-encoding each one.
pub(crate) fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, AnalysisError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AnalysisError::InvalidConfig(format!("'{base}' cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Describe a failed response as `HTTP <status>: <body excerpt>`.
pub(crate) async fn error_reason(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        let excerpt: String = body.chars().take(300).collect();
        format!("HTTP {status}: {excerpt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_encodes_segments() {
        let base = Url::parse("https://x.supabase.co").unwrap();
        let url = join_segments(
            &base,
            ["storage", "v1", "object", "documents", "u", "balancete maio.pdf"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://x.supabase.co/storage/v1/object/documents/u/balancete%20maio.pdf"
        );
    }

    #[test]
    fn table_url_keeps_base_path() {
        let base = Url::parse("http://127.0.0.1:54321/").unwrap();
        let url = join_segments(&base, ["rest", "v1", "document_uploads"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:54321/rest/v1/document_uploads");
    }

    #[test]
    fn new_rejects_bad_url() {
        let config = StorageConfig {
            url: "not a url".into(),
            service_key: "k".into(),
            ..Default::default()
        };
        assert!(matches!(
            SupabaseStorage::new(&config, 10, 10),
            Err(AnalysisError::InvalidConfig(_))
        ));
    }
}
