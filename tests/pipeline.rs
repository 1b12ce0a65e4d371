//! End-to-end behaviour of the analysis handler over in-memory collaborators.

mod common;

use common::*;
use doc2fin::{AnalysisError, AnalysisProgressCallback, AnalysisStatus, Stage, WebhookEvent};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn missing_id_is_rejected_without_side_effects() {
    let h = happy("doc-1");

    for event in [
        WebhookEvent::default(),
        serde_json::from_value::<WebhookEvent>(json!({ "type": "INSERT", "record": {} })).unwrap(),
        serde_json::from_value::<WebhookEvent>(json!({ "record": { "id": "" } })).unwrap(),
        serde_json::from_value::<WebhookEvent>(json!({ "record": { "id": null } })).unwrap(),
    ] {
        let (status, body) = h.handler.handle(&event).await;
        assert_eq!(status, 400);
        assert!(!body.success);
        assert!(body.error.unwrap().contains("Document ID is missing"));
    }

    assert!(h.storage.updates().is_empty());
    assert!(h.storage.inserts().is_empty());
    assert_eq!(h.inference.calls(), 0);
}

#[tokio::test]
async fn successful_run_records_fields_and_completes() {
    let h = happy("doc-1");

    let (status, body) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!(status, 200);
    assert!(body.success);
    assert_eq!(body.message.as_deref(), Some("Analysis completed successfully"));

    assert_eq!(
        h.storage.updates(),
        vec![AnalysisStatus::Analyzing, AnalysisStatus::Completed]
    );
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Completed));

    let inserts = h.storage.inserts();
    assert_eq!(inserts.len(), 1);
    let row = &inserts[0];
    assert_eq!(row.document_id, "doc-1");
    assert_eq!(row.condominium_id.as_deref(), Some("condo-7"));
    assert_eq!(row.period_month, 5);
    assert_eq!(row.period_year, 2024);
    assert_eq!(row.total_revenue, 10000.0);
    assert_eq!(row.total_expenses, 8000.0);
    assert_eq!(row.reserve_fund, 500.0);
    assert_eq!(row.default_amount, 0.0);
    assert_eq!(row.cost_per_unit, 50.0);
    assert_eq!(row.personnel_expense_percentage, 30.0);
}

#[tokio::test]
async fn completed_status_carries_timestamp() {
    let h = happy("doc-1");
    let outcome = h.handler.analyze("doc-1").await.unwrap();

    let state = h.storage.state.lock().unwrap();
    let (_, last) = state.updates.last().unwrap();
    assert_eq!(last.analysis_status, AnalysisStatus::Completed);
    assert_eq!(last.analyzed_at, Some(outcome.analyzed_at));
    assert_eq!(
        state.documents["doc-1"].analyzed_at,
        Some(outcome.analyzed_at)
    );
}

#[tokio::test]
async fn outcome_reports_stats() {
    let h = happy("doc-1");
    let outcome = h.handler.analyze("doc-1").await.unwrap();

    assert_eq!(outcome.document_id, "doc-1");
    assert_eq!(outcome.stats.file_bytes, b"%PDF-1.7 balancete".len());
    assert!(outcome.stats.text_chars > 0);
    assert_eq!(outcome.fields.reference_year, 2024);
}

#[tokio::test]
async fn inference_sees_extracted_text() {
    let h = happy("doc-1");
    h.handler.analyze("doc-1").await.unwrap();

    let prompts = h.inference.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Receita total"));
}

#[tokio::test]
async fn mime_type_falls_back_to_pdf() {
    let mut doc = document("doc-2");
    doc.file_type = None;
    let h = harness(
        MemoryStorage::with_document(doc, b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::answering(EXAMPLE_ANSWER),
    );
    h.handler.analyze("doc-2").await.unwrap();

    assert_eq!(
        *h.extractor.seen_mime.lock().unwrap(),
        vec!["application/pdf".to_string()]
    );
}

#[tokio::test]
async fn declared_mime_type_is_forwarded() {
    let mut doc = document("doc-3");
    doc.file_type = Some("image/jpeg".into());
    let h = harness(
        MemoryStorage::with_document(doc, b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::answering(EXAMPLE_ANSWER),
    );
    h.handler.analyze("doc-3").await.unwrap();

    assert_eq!(
        *h.extractor.seen_mime.lock().unwrap(),
        vec!["image/jpeg".to_string()]
    );
}

#[tokio::test]
async fn unknown_document_fails_without_insert() {
    let h = happy("doc-1");

    let (status, body) = h.handler.handle(&WebhookEvent::for_document("nope")).await;

    assert_eq!(status, 500);
    assert!(!body.success);
    assert!(body.error.unwrap().contains("not found"));
    assert!(h.storage.inserts().is_empty());
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Pending));
    assert_eq!(h.inference.calls(), 0);
}

#[tokio::test]
async fn empty_extraction_marks_failed() {
    for text in ["", "   \n\t "] {
        let h = harness(
            MemoryStorage::with_document(document("doc-1"), b"bytes"),
            FakeExtractor::text(text),
            FakeInference::answering(EXAMPLE_ANSWER),
        );

        let err = h.handler.analyze("doc-1").await.unwrap_err();

        assert!(matches!(err, AnalysisError::EmptyExtraction { .. }));
        assert!(h.storage.inserts().is_empty());
        assert_eq!(h.inference.calls(), 0);
        assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
    }
}

#[tokio::test]
async fn extraction_error_marks_failed() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::new(Extraction::Fail("PERMISSION_DENIED".into())),
        FakeInference::answering(EXAMPLE_ANSWER),
    );

    let (status, body) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!(status, 500);
    assert!(body.error.unwrap().contains("PERMISSION_DENIED"));
    assert_eq!(
        h.storage.updates(),
        vec![AnalysisStatus::Analyzing, AnalysisStatus::Failed]
    );
}

#[tokio::test]
async fn missing_blob_marks_failed() {
    let h = happy("doc-1");
    h.storage.state.lock().unwrap().blobs.clear();

    let err = h.handler.analyze("doc-1").await.unwrap_err();

    assert!(matches!(err, AnalysisError::DownloadFailed { .. }));
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn malformed_inference_marks_failed() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::answering("Desculpe, não consegui identificar os valores."),
    );

    let (status, body) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!(status, 500);
    assert!(body.error.unwrap().contains("not valid JSON"));
    assert!(h.storage.inserts().is_empty());
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn inference_error_marks_failed() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::failing("rate limited"),
    );

    let err = h.handler.analyze("doc-1").await.unwrap_err();
    assert!(err.to_string().contains("rate limited"));
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn fenced_answer_with_partial_fields_is_accepted() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::answering("```json\n{\"total_revenue\": \"12.500,75\", \"reference_month\": 3}\n```"),
    );

    let outcome = h.handler.analyze("doc-1").await.unwrap();

    assert_eq!(outcome.record.total_revenue, 12500.75);
    assert_eq!(outcome.record.period_month, 3);
    assert_eq!(outcome.record.period_year, 0);
    assert_eq!(outcome.record.total_expenses, 0.0);
}

#[tokio::test]
async fn analyzing_update_failure_is_not_fatal() {
    let h = happy("doc-1");
    h.storage
        .state
        .lock()
        .unwrap()
        .fail_updates_to
        .push(AnalysisStatus::Analyzing);

    let (status, _) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!(status, 200);
    assert_eq!(h.storage.inserts().len(), 1);
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Completed));
}

#[tokio::test]
async fn failed_update_failure_does_not_mask_original_error() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::text(""),
        FakeInference::answering(EXAMPLE_ANSWER),
    );
    h.storage
        .state
        .lock()
        .unwrap()
        .fail_updates_to
        .push(AnalysisStatus::Failed);

    let err = h.handler.analyze("doc-1").await.unwrap_err();

    assert!(matches!(err, AnalysisError::EmptyExtraction { .. }));
    assert_eq!(
        h.storage.updates(),
        vec![AnalysisStatus::Analyzing, AnalysisStatus::Failed]
    );
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Analyzing));
}

#[tokio::test]
async fn insert_failure_marks_failed() {
    let h = happy("doc-1");
    h.storage.state.lock().unwrap().fail_inserts = true;

    let err = h.handler.analyze("doc-1").await.unwrap_err();

    assert!(matches!(err, AnalysisError::Storage { .. }));
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn completed_update_failure_leaves_inserted_row() {
    let h = happy("doc-1");
    h.storage
        .state
        .lock()
        .unwrap()
        .fail_updates_to
        .push(AnalysisStatus::Completed);

    let (status, _) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!(status, 500);
    assert_eq!(h.storage.inserts().len(), 1);
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn redelivery_inserts_a_second_row() {
    let h = happy("doc-1");

    let (first, _) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;
    let (second, _) = h.handler.handle(&WebhookEvent::for_document("doc-1")).await;

    assert_eq!((first, second), (200, 200));
    assert_eq!(h.storage.inserts().len(), 2);
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Completed));
}

#[tokio::test]
async fn completed_document_is_analysed_again_with_warning() {
    let mut doc = document("doc-1");
    doc.analysis_status = AnalysisStatus::Completed;
    let h = harness(
        MemoryStorage::with_document(doc, b"%PDF"),
        FakeExtractor::text("Receita total 10.000,00"),
        FakeInference::answering(EXAMPLE_ANSWER),
    );
    let (_guard, logs) = capture_logs();

    h.handler.analyze("doc-1").await.unwrap();

    assert!(
        logs.contents().contains("is 'completed', not pending; analysing again"),
        "{}",
        logs.contents()
    );
    assert_eq!(
        h.storage.updates(),
        [AnalysisStatus::Analyzing, AnalysisStatus::Completed]
    );
    assert_eq!(h.storage.inserts().len(), 1);
}

#[tokio::test]
async fn pending_document_runs_without_warning() {
    let h = happy("doc-1");
    let (_guard, logs) = capture_logs();

    h.handler.analyze("doc-1").await.unwrap();

    assert!(!logs.contents().contains("not pending"), "{}", logs.contents());
}

#[tokio::test]
async fn hanging_extraction_times_out() {
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::new(Extraction::Hang),
        FakeInference::answering(EXAMPLE_ANSWER),
    );

    let err = h.handler.analyze("doc-1").await.unwrap_err();

    assert!(matches!(err, AnalysisError::Timeout { .. }), "{err:?}");
    assert!(err.to_string().contains("timed out after 1s"));
    assert_eq!(h.storage.status_of("doc-1"), Some(AnalysisStatus::Failed));
}

#[tokio::test]
async fn numeric_record_id_is_accepted() {
    let h = happy("42");
    let event: WebhookEvent =
        serde_json::from_value(json!({ "type": "INSERT", "record": { "id": 42 } })).unwrap();

    let (status, _) = h.handler.handle(&event).await;

    assert_eq!(status, 200);
    assert_eq!(h.storage.inserts()[0].document_id, "42");
}

// ── Progress events ──────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl AnalysisProgressCallback for Recorder {
    fn on_run_start(&self, id: &str) {
        self.events.lock().unwrap().push(format!("start {id}"));
    }
    fn on_stage_complete(&self, _id: &str, stage: Stage, _elapsed_ms: u64) {
        self.events.lock().unwrap().push(format!("{stage:?}"));
    }
    fn on_run_complete(&self, _id: &str, _total_ms: u64) {
        self.events.lock().unwrap().push("done".into());
    }
    fn on_run_failed(&self, _id: &str, stage: Stage, _error: &str) {
        self.events.lock().unwrap().push(format!("failed at {stage:?}"));
    }
}

#[tokio::test]
async fn progress_follows_stage_order() {
    let recorder = Arc::new(Recorder::default());
    let h = happy("doc-1");
    let handler = h.handler.with_progress(recorder.clone());

    handler.analyze("doc-1").await.unwrap();

    let mut expected = vec!["start doc-1".to_string()];
    expected.extend(Stage::ALL.iter().map(|s| format!("{s:?}")));
    expected.push("done".into());
    assert_eq!(*recorder.events.lock().unwrap(), expected);
}

#[tokio::test]
async fn progress_reports_failing_stage() {
    let recorder = Arc::new(Recorder::default());
    let h = harness(
        MemoryStorage::with_document(document("doc-1"), b"bytes"),
        FakeExtractor::text("Receita"),
        FakeInference::answering("no json here"),
    );
    let handler = h.handler.with_progress(recorder.clone());

    handler.analyze("doc-1").await.unwrap_err();

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.last().unwrap(), "failed at Infer");
    assert!(events.contains(&"Extract".to_string()));
    assert!(!events.contains(&"Persist".to_string()));
}
