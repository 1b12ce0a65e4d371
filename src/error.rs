//! Error types for the doc2fin library.
//!
//! A single [`AnalysisError`] covers every way an analysis run can end
//! early. Each variant belongs to one [`ErrorKind`], and the kind alone
//! decides what the webhook caller sees:
//!
//! * [`ErrorKind::Validation`]: the event itself is unusable (no document
//!   id). Answered with HTTP 400; no record is touched because none is known.
//!
//! * [`ErrorKind::NotFound`], [`ErrorKind::Dependency`], [`ErrorKind::Parse`]
//!   are fatal for the run. The handler marks the document `failed`
//!   (best-effort) and answers HTTP 500 with the error message.
//!
//! * [`ErrorKind::Config`]: raised at startup, before any request is served.

use thiserror::Error;

/// Coarse classification of an [`AnalysisError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed inbound event.
    Validation,
    /// The referenced document does not exist.
    NotFound,
    /// A storage, extraction or inference call failed or returned nothing.
    Dependency,
    /// Inference output could not be read as the financial schema.
    Parse,
    /// Invalid or missing configuration.
    Config,
}

/// All errors returned by the doc2fin library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// The webhook payload carried no usable document identifier.
    #[error("Document ID is missing from the webhook payload")]
    MissingDocumentId,

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No document row exists for the given id.
    #[error("Document '{id}' not found")]
    DocumentNotFound { id: String },

    // ── Dependency errors ─────────────────────────────────────────────────
    /// A table operation against the storage backend failed.
    #[error("Storage {operation} failed: {reason}")]
    Storage { operation: String, reason: String },

    /// The raw file could not be downloaded from the bucket.
    #[error("Failed to download '{path}': {reason}")]
    DownloadFailed { path: String, reason: String },

    /// The text-extraction service returned an error.
    #[error("Text extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    /// The text-extraction service answered but produced no text.
    #[error("No text extracted from document '{id}'")]
    EmptyExtraction { id: String },

    /// The inference service returned an error.
    #[error("Field inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// An external call did not answer within the configured bound.
    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    // ── Parse errors ──────────────────────────────────────────────────────
    /// Inference output contained no recoverable JSON object.
    #[error("Inference response is not valid JSON: {detail}")]
    UnparseableInference { detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation or environment lookup failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::MissingDocumentId => ErrorKind::Validation,
            AnalysisError::DocumentNotFound { .. } => ErrorKind::NotFound,
            AnalysisError::Storage { .. }
            | AnalysisError::DownloadFailed { .. }
            | AnalysisError::ExtractionFailed { .. }
            | AnalysisError::EmptyExtraction { .. }
            | AnalysisError::InferenceFailed { .. }
            | AnalysisError::Timeout { .. }
            | AnalysisError::Internal(_) => ErrorKind::Dependency,
            AnalysisError::UnparseableInference { .. } => ErrorKind::Parse,
            AnalysisError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// HTTP status code reported to the webhook caller.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            _ => 500,
        }
    }

    /// Whether the run should try to leave the document in `failed`.
    pub fn marks_failed(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Validation | ErrorKind::Config)
    }

    pub(crate) fn storage(operation: &str, reason: impl ToString) -> Self {
        AnalysisError::Storage {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}
