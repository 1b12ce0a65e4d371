//! The document analysis run.
//!
//! [`DocumentAnalysisHandler::analyze`] executes one strictly sequential
//! run for one document:
//!
//! ```text
//! fetch ─▶ mark analyzing ─▶ download ─▶ extract ─▶ infer ─▶ insert ─▶ mark completed
//!              (best-effort)
//! ```
//!
//! Any fatal error stops the run; the document is then marked `failed`
//! (best-effort, the result is only logged) and the error is returned.
//! [`DocumentAnalysisHandler::handle`] wraps this for the webhook: it never
//! fails, it maps the outcome onto an HTTP status and a JSON body.
//!
//! There are no retries and no compensation. A redelivered event for a
//! document that already completed runs again and inserts a second
//! analysis row; two concurrent deliveries for the same id are not
//! serialised.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::pipeline::extract::{ExtractorClient, TextExtractor};
use crate::pipeline::infer::{FieldInference, LlmFieldInference};
use crate::pipeline::parse::parse_financial_fields;
use crate::pipeline::storage::{StorageClient, SupabaseStorage};
use crate::progress::{AnalysisProgressCallback, ProgressCallback, Stage};
use crate::record::{
    AnalysisOutcome, AnalysisStats, AnalysisStatus, FinancialAnalysisRecord, StatusUpdate,
    WebhookEvent, WebhookResponse,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Message returned to the webhook caller on success.
pub const SUCCESS_MESSAGE: &str = "Analysis completed successfully";

/// Orchestrates storage, extraction and inference for one document at a time.
pub struct DocumentAnalysisHandler {
    storage: Arc<dyn StorageClient>,
    extractor: Arc<dyn TextExtractor>,
    inference: Arc<dyn FieldInference>,
    config: AnalysisConfig,
    progress: Option<ProgressCallback>,
}

/// A fatal error together with the stage that raised it.
struct StageFailure {
    stage: Stage,
    error: AnalysisError,
}

impl DocumentAnalysisHandler {
    /// Assemble a handler from explicit collaborators.
    pub fn new(
        storage: Arc<dyn StorageClient>,
        extractor: Arc<dyn TextExtractor>,
        inference: Arc<dyn FieldInference>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            storage,
            extractor,
            inference,
            config,
            progress: None,
        }
    }

    /// Build the production collaborators described by `config`.
    pub fn from_config(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        let storage = SupabaseStorage::new(
            &config.storage,
            config.call_timeout_secs,
            config.download_timeout_secs,
        )?;
        let extractor = ExtractorClient::new(config.extraction.clone(), config.call_timeout_secs)?;
        let inference = LlmFieldInference::from_config(&config)?;
        info!(
            "Handler ready: storage {}, extractor {}, model {}",
            config.storage.url,
            config.extraction.name(),
            config.model_or_default()
        );
        Ok(Self::new(
            Arc::new(storage),
            Arc::new(extractor),
            Arc::new(inference),
            config,
        ))
    }

    /// Attach a progress observer.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Process one webhook event and produce the HTTP status and body.
    pub async fn handle(&self, event: &WebhookEvent) -> (u16, WebhookResponse) {
        let Some(document_id) = event.document_id() else {
            let e = AnalysisError::MissingDocumentId;
            warn!("Rejecting webhook: {}", e);
            return (e.http_status(), WebhookResponse::err(e.to_string()));
        };

        match self.analyze(&document_id).await {
            Ok(_) => (200, WebhookResponse::ok(SUCCESS_MESSAGE)),
            Err(e) => (e.http_status(), WebhookResponse::err(e.to_string())),
        }
    }

    /// Run the full analysis for `document_id`.
    ///
    /// # Errors
    /// [`AnalysisError::MissingDocumentId`] for a blank id (nothing is
    /// touched); otherwise the first fatal error, after a best-effort attempt
    /// to mark the document `failed`.
    pub async fn analyze(&self, document_id: &str) -> Result<AnalysisOutcome, AnalysisError> {
        let document_id = document_id.trim();
        if document_id.is_empty() {
            return Err(AnalysisError::MissingDocumentId);
        }

        let start = Instant::now();
        info!("Starting analysis for document: {}", document_id);
        self.emit(|cb| cb.on_run_start(document_id));

        match self.run(document_id, start).await {
            Ok(outcome) => {
                info!(
                    "Analysis of {} completed in {}ms",
                    document_id, outcome.stats.total_ms
                );
                self.emit(|cb| cb.on_run_complete(document_id, outcome.stats.total_ms));
                Ok(outcome)
            }
            Err(StageFailure { stage, error }) => {
                error!("Analysis of {} failed at '{}': {}", document_id, stage, error);
                if error.marks_failed() {
                    self.mark_failed(document_id).await;
                }
                let message = error.to_string();
                self.emit(|cb| cb.on_run_failed(document_id, stage, &message));
                Err(error)
            }
        }
    }

    async fn run(&self, id: &str, start: Instant) -> Result<AnalysisOutcome, StageFailure> {
        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);
        let download_timeout = Duration::from_secs(self.config.download_timeout_secs);

        // ── Step 1: Load the document row ────────────────────────────────
        let (document, _) = self
            .stage(id, Stage::Fetch, call_timeout, self.storage.get_document(id))
            .await?;
        if !document
            .analysis_status
            .can_transition_to(AnalysisStatus::Analyzing)
        {
            warn!(
                "Document {} is '{}', not pending; analysing again",
                id, document.analysis_status
            );
        }

        // ── Step 2: Mark analyzing (best-effort) ─────────────────────────
        let analyzing = StatusUpdate::analyzing();
        if let Err(f) = self
            .stage(
                id,
                Stage::MarkAnalyzing,
                call_timeout,
                self.storage.update_document(id, &analyzing),
            )
            .await
        {
            warn!("Could not mark {} as analyzing, continuing: {}", id, f.error);
        }

        // ── Step 3: Download the file ────────────────────────────────────
        let (bytes, download_ms) = self
            .stage(
                id,
                Stage::Download,
                download_timeout,
                self.storage.download_blob(&document.storage_path),
            )
            .await?;
        info!("Downloaded {} bytes for {}", bytes.len(), id);

        // ── Step 4: Extract text ─────────────────────────────────────────
        let mime_type = document.mime_type(&self.config.default_mime_type);
        let (text, extraction_ms) = self
            .stage(id, Stage::Extract, call_timeout, async {
                let text = self.extractor.extract(&bytes, mime_type).await?;
                if text.trim().is_empty() {
                    return Err(AnalysisError::EmptyExtraction { id: id.to_string() });
                }
                Ok(text)
            })
            .await?;
        let text_chars = text.chars().count();
        info!("Text extracted for {}: {} chars", id, text_chars);

        // ── Step 5: Infer and parse the financial fields ─────────────────
        let (fields, inference_ms) = self
            .stage(id, Stage::Infer, call_timeout, async {
                let answer = self.inference.infer(&text).await?;
                parse_financial_fields(&answer)
            })
            .await?;

        // ── Step 6: Insert the analysis row ──────────────────────────────
        let record = FinancialAnalysisRecord::new(&document, &fields);
        self.stage(
            id,
            Stage::Persist,
            call_timeout,
            self.storage.insert_analysis(&record),
        )
        .await?;

        // ── Step 7: Mark completed ───────────────────────────────────────
        let analyzed_at = Utc::now();
        let completed = StatusUpdate::completed(analyzed_at);
        self.stage(
            id,
            Stage::MarkCompleted,
            call_timeout,
            self.storage.update_document(id, &completed),
        )
        .await?;

        Ok(AnalysisOutcome {
            document_id: id.to_string(),
            record,
            fields,
            analyzed_at,
            stats: AnalysisStats {
                download_ms,
                extraction_ms,
                inference_ms,
                total_ms: start.elapsed().as_millis() as u64,
                file_bytes: bytes.len(),
                text_chars,
            },
        })
    }

    /// Run one stage under `timeout`, reporting it to the progress callback.
    async fn stage<T, F>(
        &self,
        id: &str,
        stage: Stage,
        timeout: Duration,
        fut: F,
    ) -> Result<(T, u64), StageFailure>
    where
        F: Future<Output = Result<T, AnalysisError>>,
    {
        self.emit(|cb| cb.on_stage_start(id, stage));
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout {
                stage: stage.label().to_string(),
                secs: timeout.as_secs(),
            }),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.emit(|cb| cb.on_stage_complete(id, stage, elapsed_ms));
                Ok((value, elapsed_ms))
            }
            Err(error) => Err(StageFailure { stage, error }),
        }
    }

    /// Mark the document `failed`. Errors are logged and swallowed.
    async fn mark_failed(&self, id: &str) {
        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        let update = StatusUpdate::failed();
        match tokio::time::timeout(timeout, self.storage.update_document(id, &update)).await {
            Ok(Ok(())) => info!("Document {} marked as failed", id),
            Ok(Err(e)) => warn!("Could not mark {} as failed: {}", id, e),
            Err(_) => warn!("Timed out marking {} as failed", id),
        }
    }

    fn emit(&self, f: impl FnOnce(&dyn AnalysisProgressCallback)) {
        if let Some(ref cb) = self.progress {
            f(cb.as_ref());
        }
    }
}
