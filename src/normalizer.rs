// 🧹 Response Normalizer - backend text → validated transaction candidates
//
// Backend output is untrusted: it may wrap the JSON in commentary, use
// arbitrary date layouts, signed amounts or unknown types. Each entry is
// validated on its own; one bad entry never aborts the batch.

use crate::error::NormalizeError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Confidence used when the backend does not provide one
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Layouts tried (in order) for dates not already in ISO form.
/// Every layout ends with its year.
const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y",
    "%m/%d/%y",
    "%d/%m/%Y",
    "%d/%m/%y",
    "%m-%d-%Y",
    "%m-%d-%y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Expense,
    Income,
}

impl TransactionType {
    /// Lowercase encoding used by backends and the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Expense => "expense",
            TransactionType::Income => "income",
        }
    }

    /// Uppercase encoding stored on staged candidates
    pub fn staging_code(&self) -> &'static str {
        match self {
            TransactionType::Expense => "EXPENSE",
            TransactionType::Income => "INCOME",
        }
    }

    /// Lenient parse used for backend output: anything unrecognised is an expense
    pub fn from_backend(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or(TransactionType::Expense)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "expense" => Ok(TransactionType::Expense),
            "income" => Ok(TransactionType::Income),
            other => Err(format!("Unknown transaction type: {}", other)),
        }
    }
}

/// Statement metadata; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementInfo {
    pub bank_name: Option<String>,
    pub account_type: Option<String>,
    pub last_four: Option<String>,
    pub statement_start: Option<String>,
    pub statement_end: Option<String>,
}

/// A transaction candidate that passed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTransaction {
    /// ISO YYYY-MM-DD when recognised, otherwise the backend's original string
    pub date: String,
    pub description: String,
    pub original_description: String,
    /// Always > 0; the sign lives in `transaction_type`
    pub amount: f64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub category: Option<String>,
    pub confidence: f64,
    /// 1-based position in the backend's transaction list
    pub line_number: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub statement_info: StatementInfo,
    pub transactions: Vec<ExtractedTransaction>,
    /// Entries the backend proposed that failed validation
    pub skipped: usize,
    pub raw_response: String,
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Parse and validate raw backend output
pub fn normalize_response(raw: &str) -> Result<Extraction, NormalizeError> {
    let block = find_structured_block(raw).ok_or(NormalizeError::NoStructuredData)?;

    let value: Value =
        serde_json::from_str(block).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
    let data = value
        .as_object()
        .ok_or_else(|| NormalizeError::Malformed("top-level value is not an object".to_string()))?;

    let statement_info = parse_statement_info(data.get("statement_info"));

    let entries: &[Value] = data
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut transactions = Vec::new();
    let mut skipped = 0;

    for (idx, entry) in entries.iter().enumerate() {
        match parse_transaction(entry, idx + 1) {
            Some(tx) => transactions.push(tx),
            None => {
                skipped += 1;
                debug!(line = idx + 1, "Skipping invalid transaction entry");
            }
        }
    }

    Ok(Extraction {
        statement_info,
        transactions,
        skipped,
        raw_response: raw.to_string(),
    })
}

/// First balanced `{ ... }` block in `text`. Braces inside JSON string
/// literals are ignored; an unbalanced tail is not a block.
pub fn find_structured_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
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
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_statement_info(value: Option<&Value>) -> StatementInfo {
    let info = match value.and_then(Value::as_object) {
        Some(map) => map,
        None => return StatementInfo::default(),
    };

    StatementInfo {
        bank_name: string_field(info, "bank_name"),
        account_type: string_field(info, "account_type"),
        last_four: string_field(info, "last_four"),
        statement_start: string_field(info, "statement_start").map(|d| normalize_date(&d)),
        statement_end: string_field(info, "statement_end").map(|d| normalize_date(&d)),
    }
}

fn parse_transaction(entry: &Value, line_number: usize) -> Option<ExtractedTransaction> {
    let map = entry.as_object()?;

    let date = normalize_date(&string_field(map, "date").unwrap_or_default());
    let amount = parse_amount(map.get("amount")?)?.abs();

    // magnitude and date are the two hard requirements
    if !(amount > 0.0) || !amount.is_finite() || date.trim().is_empty() {
        return None;
    }

    let description = string_field(map, "description").unwrap_or_else(|| "Unknown".to_string());
    let original_description = string_field(map, "original_description")
        .or_else(|| string_field(map, "description"))
        .unwrap_or_default();

    let confidence = match map.get("confidence") {
        None | Some(Value::Null) => DEFAULT_CONFIDENCE,
        Some(v) => parse_amount(v)?.clamp(0.0, 1.0),
    };

    Some(ExtractedTransaction {
        date,
        description,
        original_description,
        amount,
        transaction_type: TransactionType::from_backend(map.get("type").and_then(Value::as_str)),
        category: string_field(map, "category"),
        confidence,
        line_number,
    })
}

/// Numbers, or numeric strings like "$1,234.50" / "-12.00"
fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, ',' | '$' | ' '))
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalize a date to YYYY-MM-DD.
///
/// ISO input is returned unchanged; otherwise the layouts in `DATE_FORMATS`
/// are tried in order. Unrecognised input is passed through as-is.
pub fn normalize_date(date_str: &str) -> String {
    if date_str.is_empty() {
        return String::new();
    }

    if is_iso_date(date_str) {
        return date_str.to_string();
    }

    let trimmed = date_str.trim();
    let year_digits = trimmed.bytes().rev().take_while(u8::is_ascii_digit).count();

    // chrono's %Y takes any number of digits, so "24" would otherwise become year 24
    for fmt in DATE_FORMATS.iter().filter(|fmt| year_width(fmt) == year_digits) {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return date.format("%Y-%m-%d").to_string();
        }
    }

    date_str.to_string()
}

fn year_width(fmt: &str) -> usize {
    if fmt.ends_with("%y") {
        2
    } else {
        4
    }
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}

// ============================================================================
// TESTS
// ============================================================================
