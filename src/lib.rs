//! # doc2fin
//!
//! Read condominium financial statements (balancetes, prestações de contas)
//! and store their key figures as structured rows.
//!
//! A database webhook fires when a document row is inserted. The handler
//! loads the row, downloads the file from object storage, runs OCR on it,
//! asks a language model for eight financial fields, and writes them to the
//! analysis table, tracking progress in the document's `analysis_status`.
//!
//! ## Pipeline Overview
//!
//! ```text
//! webhook { record: { id } }
//!  │
//!  ├─ 1. Fetch     load the document row
//!  ├─ 2. Mark      analysis_status = analyzing (best-effort)
//!  ├─ 3. Download  raw bytes from the storage bucket
//!  ├─ 4. Extract   Cloud Vision / Document AI text detection
//!  ├─ 5. Infer     LLM → JSON → eight numeric fields
//!  ├─ 6. Persist   insert the financial analysis row
//!  └─ 7. Mark      analysis_status = completed (failed on any error)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doc2fin::{AnalysisConfig, DocumentAnalysisHandler, WebhookEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // SUPABASE_URL, SUPABASE_SERVICE_ROLE_KEY, GOOGLE_CLOUD_VISION_API_KEY, OPENAI_API_KEY
//!     let config = AnalysisConfig::from_env()?;
//!     let handler = DocumentAnalysisHandler::from_config(config)?;
//!
//!     let (status, body) = handler.handle(&WebhookEvent::for_document("doc-1")).await;
//!     println!("{status} {}", serde_json::to_string(&body)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2fin` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the handler in another service:
//! ```toml
//! doc2fin = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AnalysisConfig, AnalysisConfigBuilder, CredentialSource, ExtractionBackend, StorageConfig,
};
pub use error::{AnalysisError, ErrorKind};
pub use handler::DocumentAnalysisHandler;
pub use pipeline::auth::{GoogleCredentials, ServiceAccountKey};
pub use pipeline::extract::{ExtractorClient, TextExtractor};
pub use pipeline::infer::{FieldInference, LlmFieldInference};
pub use pipeline::parse::parse_financial_fields;
pub use pipeline::storage::{StorageClient, SupabaseStorage};
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use record::{
    AnalysisOutcome, AnalysisStats, AnalysisStatus, DocumentRecord, FinancialAnalysisRecord,
    FinancialFields, StatusUpdate, WebhookEvent, WebhookResponse,
};
pub use server::{create_router, serve, AppState};
