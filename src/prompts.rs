//! Prompts for financial-field inference.
//!
//! The instruction contract lives here so it can be changed, and inspected
//! by tests, without touching the inference or parsing code. Callers can
//! override the system prompt via [`crate::config::AnalysisConfig::system_prompt`].

/// Default system prompt.
///
/// The field list must stay in sync with [`crate::record::FinancialFields`].
pub const FINANCIAL_SYSTEM_PROMPT: &str = r#"You are an expert in analysing condominium financial documents (balance sheets, "balancetes", accountability reports). Analyse the extracted text and return ONLY a valid JSON object with exactly these fields:

{"total_revenue": number, "total_expenses": number, "reserve_fund": number, "default_amount": number, "cost_per_unit": number, "personnel_expense_percentage": number, "reference_month": number (1-12), "reference_year": number}

Rules:
- Extract only real numeric values stated in the document.
- Write numbers as plain JSON numbers: no currency symbols, no thousands separators, "." as the decimal point.
- personnel_expense_percentage is a percentage between 0 and 100.
- If a field is not found, use 0.
- Do NOT add commentary, explanations or markdown fences."#;

/// Extra instruction appended when the caller asks for a JSON object.
pub const JSON_OBJECT_HINT: &str = "Respond with a single JSON object and nothing else.";

/// Build the user message carrying the extracted document text.
pub fn analysis_request(text: &str) -> String {
    format!("Analyse this condominium financial document:\n\n{}", text)
}
