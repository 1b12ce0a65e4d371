//! Response parsing: raw model answer → [`FinancialFields`].
//!
//! Models are asked for a bare JSON object but do not always comply. The
//! parser applies, in order:
//!
//! 1. Strip an outer ```` ```json ```` fence.
//! 2. Parse the whole answer as JSON.
//! 3. Otherwise recover the first balanced `{…}` substring that parses as a
//!    JSON object (quotes and escapes are respected while balancing).
//! 4. Project the object onto the fixed schema: missing, null or
//!    non-numeric fields become 0, numeric strings in Brazilian or
//!    international notation are coerced, and a month outside 1–12 becomes 0.
//!
//! Only an answer with no recoverable object is an error.

use crate::error::AnalysisError;
use crate::record::FinancialFields;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Parse a model answer into the financial schema.
pub fn parse_financial_fields(raw: &str) -> Result<FinancialFields, AnalysisError> {
    let object = extract_object(raw).ok_or_else(|| AnalysisError::UnparseableInference {
        detail: excerpt(raw),
    })?;
    Ok(project_fields(&object))
}

/// Locate the JSON object in a model answer.
pub fn extract_object(raw: &str) -> Option<Map<String, Value>> {
    let body = strip_code_fences(raw);
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body.trim()) {
        return Some(map);
    }

    let mut offset = 0;
    while let Some(rel) = body[offset..].find('{') {
        let start = offset + rel;
        if let Some(candidate) = balanced_object(&body[start..]) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                debug!("Recovered JSON object from surrounding commentary");
                return Some(map);
            }
        }
        offset = start + 1;
    }

    warn!("No JSON object found in model answer");
    None
}

// ── Fences ───────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").expect("valid fence regex")
});

fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Balanced-object scan ─────────────────────────────────────────────────

/// The balanced `{…}` prefix of `s`, which must start with `{`. Braces
/// inside string literals are ignored.
fn balanced_object(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Projection ───────────────────────────────────────────────────────────

/// Map a JSON object onto the fixed schema, defaulting to 0.
pub fn project_fields(obj: &Map<String, Value>) -> FinancialFields {
    let amount = |name: &str| obj.get(name).and_then(coerce_number).unwrap_or(0.0);

    let month = obj
        .get("reference_month")
        .and_then(coerce_number)
        .and_then(whole_number)
        .filter(|m| (1..=12).contains(m))
        .unwrap_or(0);
    let year = obj
        .get("reference_year")
        .and_then(coerce_number)
        .and_then(whole_number)
        .unwrap_or(0);

    FinancialFields {
        total_revenue: amount("total_revenue"),
        total_expenses: amount("total_expenses"),
        reserve_fund: amount("reserve_fund"),
        default_amount: amount("default_amount"),
        cost_per_unit: amount("cost_per_unit"),
        personnel_expense_percentage: amount("personnel_expense_percentage"),
        reference_month: month,
        reference_year: year,
    }
}

fn whole_number(v: f64) -> Option<u32> {
    (v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}

/// Read a JSON value as a finite number.
fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_localized_number(s)?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Parse numbers such as `"10.000,50"`, `"R$ 1,234.56"`, `"30%"` or `"1.500"`.
///
/// With both separators present the later one is the decimal point. With a
/// single kind of separator, repeated separators are thousands grouping; a
/// lone `.` followed by exactly three digits after a non-zero integer part
/// is read as grouping (`"1.500"` → 1500), and a lone `,` is a decimal comma.
fn parse_localized_number(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalised = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => {
            if cleaned.matches(',').count() > 1 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (None, Some(d)) => {
            let dots = cleaned.matches('.').count();
            let int_part = cleaned[..d].trim_start_matches('-');
            let frac_len = cleaned.len() - d - 1;
            let grouped = dots > 1
                || (frac_len == 3 && !int_part.trim_start_matches('0').is_empty());
            if grouped {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };
    normalised.parse().ok()
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "empty answer".to_string();
    }
    let mut out: String = trimmed.chars().take(120).collect();
    if trimmed.chars().count() > 120 {
        out.push('…');
    }
    out
}
