//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use doc2fin::{
    AnalysisConfig, AnalysisError, AnalysisStatus, DocumentAnalysisHandler, DocumentRecord,
    ExtractionBackend, FieldInference, FinancialAnalysisRecord, StatusUpdate, StorageClient,
    TextExtractor,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub const EXAMPLE_ANSWER: &str = r#"{"total_revenue":10000,"total_expenses":8000,"reserve_fund":500,"default_amount":0,"cost_per_unit":50,"personnel_expense_percentage":30,"reference_month":5,"reference_year":2024}"#;

pub fn document(id: &str) -> DocumentRecord {
    DocumentRecord {
        id: id.to_string(),
        storage_path: format!("uploads/{id}.pdf"),
        condominium_id: Some("condo-7".to_string()),
        file_type: Some("application/pdf".to_string()),
        analysis_status: AnalysisStatus::Pending,
        analyzed_at: None,
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct StoreState {
    pub documents: HashMap<String, DocumentRecord>,
    pub blobs: HashMap<String, Vec<u8>>,
    /// Every status update attempted, in order, including failed attempts.
    pub updates: Vec<(String, StatusUpdate)>,
    pub inserts: Vec<FinancialAnalysisRecord>,
    pub fail_updates_to: Vec<AnalysisStatus>,
    pub fail_inserts: bool,
}

#[derive(Default)]
pub struct MemoryStorage {
    pub state: Mutex<StoreState>,
}

impl MemoryStorage {
    pub fn with_document(doc: DocumentRecord, bytes: &[u8]) -> Self {
        let storage = Self::default();
        {
            let mut s = storage.state.lock().unwrap();
            s.blobs.insert(doc.storage_path.clone(), bytes.to_vec());
            s.documents.insert(doc.id.clone(), doc);
        }
        storage
    }

    pub fn status_of(&self, id: &str) -> Option<AnalysisStatus> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(id)
            .map(|d| d.analysis_status)
    }

    pub fn updates(&self) -> Vec<AnalysisStatus> {
        self.state
            .lock()
            .unwrap()
            .updates
            .iter()
            .map(|(_, u)| u.analysis_status)
            .collect()
    }

    pub fn inserts(&self) -> Vec<FinancialAnalysisRecord> {
        self.state.lock().unwrap().inserts.clone()
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn get_document(&self, id: &str) -> Result<DocumentRecord, AnalysisError> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| AnalysisError::DocumentNotFound { id: id.to_string() })
    }

    async fn update_document(&self, id: &str, update: &StatusUpdate) -> Result<(), AnalysisError> {
        let mut s = self.state.lock().unwrap();
        s.updates.push((id.to_string(), update.clone()));
        if s.fail_updates_to.contains(&update.analysis_status) {
            return Err(AnalysisError::Storage {
                operation: "update".into(),
                reason: "HTTP 503 Service Unavailable".into(),
            });
        }
        if let Some(doc) = s.documents.get_mut(id) {
            doc.analysis_status = update.analysis_status;
            if update.analyzed_at.is_some() {
                doc.analyzed_at = update.analyzed_at;
            }
        }
        Ok(())
    }

    async fn download_blob(&self, path: &str) -> Result<Vec<u8>, AnalysisError> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(path)
            .cloned()
            .ok_or_else(|| AnalysisError::DownloadFailed {
                path: path.to_string(),
                reason: "HTTP 404 Not Found".into(),
            })
    }

    async fn insert_analysis(&self, record: &FinancialAnalysisRecord) -> Result<(), AnalysisError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_inserts {
            return Err(AnalysisError::Storage {
                operation: "insert".into(),
                reason: "HTTP 409 Conflict".into(),
            });
        }
        s.inserts.push(record.clone());
        Ok(())
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

pub enum Extraction {
    Text(String),
    Fail(String),
    Hang,
}

pub struct FakeExtractor {
    pub result: Extraction,
    pub seen_mime: Mutex<Vec<String>>,
}

impl FakeExtractor {
    pub fn new(result: Extraction) -> Self {
        Self {
            result,
            seen_mime: Mutex::new(Vec::new()),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(Extraction::Text(text.to_string()))
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(&self, _bytes: &[u8], mime_type: &str) -> Result<String, AnalysisError> {
        self.seen_mime.lock().unwrap().push(mime_type.to_string());
        match &self.result {
            Extraction::Text(t) => Ok(t.clone()),
            Extraction::Fail(reason) => Err(AnalysisError::ExtractionFailed {
                reason: reason.clone(),
            }),
            Extraction::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("too late".into())
            }
        }
    }
}

// ── Inference ────────────────────────────────────────────────────────────

pub struct FakeInference {
    pub answer: Result<String, String>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeInference {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Ok(answer.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl FieldInference for FakeInference {
    async fn infer(&self, text: &str) -> Result<String, AnalysisError> {
        self.prompts.lock().unwrap().push(text.to_string());
        self.answer
            .clone()
            .map_err(|reason| AnalysisError::InferenceFailed { reason })
    }
}

// ── Logs ─────────────────────────────────────────────────────────────────

/// Log output captured while a [`capture_logs`] guard is alive.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's log events into a buffer until the guard drops.
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, LogBuffer) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}

// ── Assembly ─────────────────────────────────────────────────────────────

pub fn test_config() -> AnalysisConfig {
    AnalysisConfig::builder()
        .storage_url("http://127.0.0.1:9")
        .storage_key("service-role-key")
        .extraction(ExtractionBackend::vision("vision-key"))
        .call_timeout_secs(1)
        .download_timeout_secs(1)
        .build()
        .unwrap()
}

pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub extractor: Arc<FakeExtractor>,
    pub inference: Arc<FakeInference>,
    pub handler: DocumentAnalysisHandler,
}

pub fn harness(storage: MemoryStorage, extractor: FakeExtractor, inference: FakeInference) -> Harness {
    let storage = Arc::new(storage);
    let extractor = Arc::new(extractor);
    let inference = Arc::new(inference);
    let handler = DocumentAnalysisHandler::new(
        storage.clone(),
        extractor.clone(),
        inference.clone(),
        test_config(),
    );
    Harness {
        storage,
        extractor,
        inference,
        handler,
    }
}

/// A harness where every collaborator succeeds for document `id`.
pub fn happy(id: &str) -> Harness {
    harness(
        MemoryStorage::with_document(document(id), b"%PDF-1.7 balancete"),
        FakeExtractor::text("Balancete maio/2024. Receita total R$ 10.000,00"),
        FakeInference::answering(EXAMPLE_ANSWER),
    )
}
