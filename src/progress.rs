//! Progress-callback trait for per-stage analysis events.
//!
//! Attach an [`Arc<dyn AnalysisProgressCallback>`] to a
//! [`crate::handler::DocumentAnalysisHandler`] to observe a run as it moves
//! through its stages. The CLI uses it to drive a spinner; tests use it to
//! assert stage order. Callbacks are observers only and cannot alter the run.
//!
//! # Example
//!
//! ```rust
//! use doc2fin::{AnalysisProgressCallback, Stage};
//! use std::sync::Mutex;
//!
//! #[derive(Default)]
//! struct StageLog(Mutex<Vec<Stage>>);
//!
//! impl AnalysisProgressCallback for StageLog {
//!     fn on_stage_start(&self, _document_id: &str, stage: Stage) {
//!         self.0.lock().unwrap().push(stage);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

/// One step of the analysis pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Load the document row.
    Fetch,
    /// Mark the row `analyzing`.
    MarkAnalyzing,
    /// Download the raw file.
    Download,
    /// Turn bytes into text.
    Extract,
    /// Turn text into financial fields.
    Infer,
    /// Insert the analysis row.
    Persist,
    /// Mark the row `completed`.
    MarkCompleted,
}

impl Stage {
    /// All stages in the order a successful run visits them.
    pub const ALL: [Stage; 7] = [
        Stage::Fetch,
        Stage::MarkAnalyzing,
        Stage::Download,
        Stage::Extract,
        Stage::Infer,
        Stage::Persist,
        Stage::MarkCompleted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Fetch => "Fetching document",
            Stage::MarkAnalyzing => "Marking as analyzing",
            Stage::Download => "Downloading file",
            Stage::Extract => "Extracting text",
            Stage::Infer => "Inferring financial fields",
            Stage::Persist => "Saving analysis",
            Stage::MarkCompleted => "Marking as completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Called by the handler as a run progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Implementations must be `Send + Sync` because one
/// handler serves concurrent webhook deliveries.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called once the event has been validated.
    fn on_run_start(&self, document_id: &str) {
        let _ = document_id;
    }

    /// Called just before a stage begins.
    fn on_stage_start(&self, document_id: &str, stage: Stage) {
        let _ = (document_id, stage);
    }

    /// Called when a stage finishes without a fatal error.
    ///
    /// # Arguments
    /// * `elapsed_ms` — wall-clock duration of the stage
    fn on_stage_complete(&self, document_id: &str, stage: Stage, elapsed_ms: u64) {
        let _ = (document_id, stage, elapsed_ms);
    }

    /// Called once when the run ends successfully.
    fn on_run_complete(&self, document_id: &str, total_ms: u64) {
        let _ = (document_id, total_ms);
    }

    /// Called once when the run ends with a fatal error.
    ///
    /// # Arguments
    /// * `stage` — the stage that failed
    /// * `error` — human-readable error description
    fn on_run_failed(&self, document_id: &str, stage: Stage, error: &str) {
        let _ = (document_id, stage, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type held by the handler.
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;
