//! Data model: the tracked upload, the derived financial record, and the
//! webhook envelope that links them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Document lifecycle ───────────────────────────────────────────────────

/// Analysis lifecycle of an uploaded document.
///
/// ```text
/// pending ──▶ analyzing ──▶ completed
///                  │
///                  └──────▶ failed
/// ```
///
/// `completed` and `failed` are terminal for this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing) | (Analyzing, Completed) | (Analyzing, Failed)
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the document uploads table.
///
/// Only the columns the pipeline reads are modelled; anything else the row
/// carries is ignored on deserialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Object key inside the documents bucket.
    pub storage_path: String,
    /// Owning condominium.
    #[serde(default, deserialize_with = "de_opt_id")]
    pub condominium_id: Option<String>,
    /// Declared MIME type of the upload.
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    /// The declared MIME type, or `default` when the column is empty.
    pub fn mime_type<'a>(&'a self, default: &'a str) -> &'a str {
        self.file_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(default)
    }
}

/// Column updates applied to a document row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub analysis_status: AnalysisStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn analyzing() -> Self {
        Self {
            analysis_status: AnalysisStatus::Analyzing,
            analyzed_at: None,
        }
    }

    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            analysis_status: AnalysisStatus::Completed,
            analyzed_at: Some(at),
        }
    }

    pub fn failed() -> Self {
        Self {
            analysis_status: AnalysisStatus::Failed,
            analyzed_at: None,
        }
    }
}

// ── Financial fields ─────────────────────────────────────────────────────

/// The fixed schema the inference service is asked to fill.
///
/// Every field is zero when the document does not state it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FinancialFields {
    pub total_revenue: f64,
    pub total_expenses: f64,
    pub reserve_fund: f64,
    pub default_amount: f64,
    pub cost_per_unit: f64,
    pub personnel_expense_percentage: f64,
    /// 1–12, or 0 when unknown.
    pub reference_month: u32,
    pub reference_year: u32,
}

impl FinancialFields {
    /// Field names in schema order.
    pub const NAMES: [&'static str; 8] = [
        "total_revenue",
        "total_expenses",
        "reserve_fund",
        "default_amount",
        "cost_per_unit",
        "personnel_expense_percentage",
        "reference_month",
        "reference_year",
    ];
}

/// A row of the financial analysis results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialAnalysisRecord {
    pub document_id: String,
    pub condominium_id: Option<String>,
    pub period_month: u32,
    pub period_year: u32,
    pub total_revenue: f64,
    pub total_expenses: f64,
    pub reserve_fund: f64,
    pub default_amount: f64,
    pub cost_per_unit: f64,
    pub personnel_expense_percentage: f64,
}

impl FinancialAnalysisRecord {
    /// Project parsed fields onto a row referencing `document`.
    pub fn new(document: &DocumentRecord, fields: &FinancialFields) -> Self {
        Self {
            document_id: document.id.clone(),
            condominium_id: document.condominium_id.clone(),
            period_month: fields.reference_month,
            period_year: fields.reference_year,
            total_revenue: fields.total_revenue,
            total_expenses: fields.total_expenses,
            reserve_fund: fields.reserve_fund,
            default_amount: fields.default_amount,
            cost_per_unit: fields.cost_per_unit,
            personnel_expense_percentage: fields.personnel_expense_percentage,
        }
    }
}

// ── Webhook envelope ─────────────────────────────────────────────────────

/// Database webhook payload sent when a document row is inserted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    /// The newly created row.
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
}

impl WebhookEvent {
    /// Build an event carrying just a document id.
    pub fn for_document(id: impl Into<String>) -> Self {
        Self {
            event_type: Some("INSERT".into()),
            record: Some(serde_json::json!({ "id": id.into() })),
            ..Default::default()
        }
    }

    /// The non-empty document id carried by `record.id`, if any.
    ///
    /// Numeric ids are accepted and stringified.
    pub fn document_id(&self) -> Option<String> {
        let id = self.record.as_ref()?.get("id")?;
        let id = match id {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}

/// JSON body returned to the webhook caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

// ── Run output ───────────────────────────────────────────────────────────

/// Wall-clock timing of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub download_ms: u64,
    pub extraction_ms: u64,
    pub inference_ms: u64,
    pub total_ms: u64,
    /// Bytes downloaded from the bucket.
    pub file_bytes: usize,
    /// Characters of extracted text sent to inference.
    pub text_chars: usize,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub document_id: String,
    pub record: FinancialAnalysisRecord,
    pub fields: FinancialFields,
    pub analyzed_at: DateTime<Utc>,
    pub stats: AnalysisStats,
}

// ── serde helpers ────────────────────────────────────────────────────────

fn id_from_value<E: serde::de::Error>(v: serde_json::Value) -> Result<Option<String>, E> {
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(E::custom(format!("expected string or number id, got {other}"))),
    }
}

fn de_id<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    id_from_value(v)?.ok_or_else(|| serde::de::Error::custom("id is null"))
}

fn de_opt_id<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    id_from_value(v)
}
