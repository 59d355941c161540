// Mock backend - realistic fake statements, no network
//
// Output depends only on the prompt and the anchor date: the RNG is seeded
// from a SHA-256 of the prompt, so the same document always yields the same
// transactions.

use super::{BackendKind, CompletionRequest, ExtractionBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use sha2::{Digest, Sha256};

const MODEL: &str = "mock-v1";

/// Days covered by a generated statement
const STATEMENT_DAYS: i64 = 30;

const MERCHANTS: &[(&str, &[&str])] = &[
    ("Groceries", &["WALMART", "TRADER JOES", "WHOLE FOODS", "SAFEWAY", "KROGER"]),
    ("Dining", &["STARBUCKS", "CHIPOTLE", "MCDONALDS", "DOORDASH", "UBER EATS"]),
    ("Transportation", &["SHELL", "CHEVRON", "UBER", "LYFT", "PARKING"]),
    ("Utilities", &["PG&E", "COMCAST", "ATT", "WATER UTILITY", "GARBAGE SVC"]),
    ("Entertainment", &["NETFLIX", "SPOTIFY", "HULU", "AMAZON PRIME", "DISNEY+"]),
    ("Shopping", &["AMAZON", "TARGET", "BESTBUY", "COSTCO", "HOME DEPOT"]),
    ("Healthcare", &["CVS PHARMACY", "WALGREENS", "KAISER", "DENTAL OFFICE", "VISION CTR"]),
    ("Subscriptions", &["GITHUB", "DROPBOX", "ADOBE", "MICROSOFT", "GOOGLE STORAGE"]),
];

pub struct MockBackend {
    /// Statement end date; today when unset
    anchor: Option<NaiveDate>,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend { anchor: None }
    }

    /// Fix the statement end date (tests, reproducible demos)
    pub fn with_anchor(anchor: NaiveDate) -> Self {
        MockBackend { anchor: Some(anchor) }
    }

    fn anchor(&self) -> NaiveDate {
        self.anchor.unwrap_or_else(|| Local::now().date_naive())
    }

    fn generate_statement(&self, prompt: &str) -> String {
        let mut rng = seeded_rng(prompt);
        let end = self.anchor();
        let start = end - Duration::days(STATEMENT_DAYS);

        let count = rng.gen_range(15..=25);
        let mut transactions: Vec<(NaiveDate, serde_json::Value)> = Vec::with_capacity(count);

        for _ in 0..count {
            let (category, merchants) = MERCHANTS[rng.gen_range(0..MERCHANTS.len())];
            let merchant = merchants.choose(&mut rng).copied().unwrap_or("MERCHANT");
            let (low, high) = amount_range(category);
            let amount = round2(rng.gen_range(low..high));
            let date = start + Duration::days(rng.gen_range(0..=STATEMENT_DAYS));
            let description = format!("{} #{}", merchant, rng.gen_range(1000..=9999));

            transactions.push((
                date,
                json!({
                    "date": date.format("%Y-%m-%d").to_string(),
                    "description": description,
                    "original_description": description,
                    "amount": amount,
                    "type": "expense",
                    "category": category,
                    "confidence": round2(rng.gen_range(0.75..=0.98)),
                }),
            ));
        }

        // stable sort keeps generation order within a day
        transactions.sort_by_key(|(date, _)| *date);
        let total: f64 = transactions
            .iter()
            .filter_map(|(_, tx)| tx["amount"].as_f64())
            .sum();

        let body = json!({
            "statement_info": {
                "bank_name": "Mock Bank",
                "account_type": "credit_card",
                "last_four": "1234",
                "statement_start": start.format("%Y-%m-%d").to_string(),
                "statement_end": end.format("%Y-%m-%d").to_string(),
            },
            "transactions": transactions.into_iter().map(|(_, tx)| tx).collect::<Vec<_>>(),
            "summary": {
                "total_transactions": count,
                "total_amount": round2(total),
            }
        });

        serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn model(&self) -> &str {
        MODEL
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let prompt = request.first_user_message().unwrap_or_default();
        let lowered = prompt.to_lowercase();

        if lowered.contains("transaction") || lowered.contains("statement") {
            return Ok(self.generate_statement(prompt));
        }

        Ok(json!({
            "message": "Mock response",
            "note": "This is a mock backend for testing"
        })
        .to_string())
    }

    async fn is_available(&self) -> bool {
        true
    }
}

fn seeded_rng(prompt: &str) -> StdRng {
    let digest = Sha256::digest(prompt.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    StdRng::from_seed(seed)
}

fn amount_range(category: &str) -> (f64, f64) {
    match category {
        "Utilities" | "Subscriptions" => (10.0, 150.0),
        "Groceries" => (30.0, 200.0),
        "Dining" => (8.0, 80.0),
        "Transportation" => (15.0, 100.0),
        _ => (20.0, 300.0),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ChatMessage;
    use crate::normalizer::normalize_response;

    fn extraction_request(text: &str) -> CompletionRequest {
        CompletionRequest::extraction("system".to_string(), text.to_string())
    }

    fn anchor() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
    }

    #[tokio::test]
    async fn test_statement_response_shape() {
        let backend = MockBackend::with_anchor(anchor());
        let raw = backend
            .complete(&extraction_request("Please extract all transactions from this bank statement."))
            .await
            .unwrap();

        let extraction = normalize_response(&raw).unwrap();
        let count = extraction.transactions.len();
        assert!((15..=25).contains(&count), "got {}", count);
        assert_eq!(extraction.skipped, 0);

        let info = &extraction.statement_info;
        assert_eq!(info.bank_name.as_deref(), Some("Mock Bank"));
        assert_eq!(info.last_four.as_deref(), Some("1234"));
        assert_eq!(info.statement_start.as_deref(), Some("2024-03-01"));
        assert_eq!(info.statement_end.as_deref(), Some("2024-03-31"));

        let dates: Vec<&str> = extraction.transactions.iter().map(|t| t.date.as_str()).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);

        for tx in &extraction.transactions {
            assert!(tx.date.as_str() >= "2024-03-01" && tx.date.as_str() <= "2024-03-31");
            assert!((0.75..=0.98).contains(&tx.confidence));
            assert!(tx.amount >= 8.0 && tx.amount <= 300.0);
        }
    }

    #[tokio::test]
    async fn test_deterministic_per_prompt() {
        let backend = MockBackend::with_anchor(anchor());
        let a = backend.complete(&extraction_request("statement A")).await.unwrap();
        let b = backend.complete(&extraction_request("statement A")).await.unwrap();
        let c = backend.complete(&extraction_request("statement B")).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_generic_prompt() {
        let backend = MockBackend::new();
        let request = CompletionRequest::new(vec![ChatMessage::user("hello there")]);
        let raw = backend.complete(&request).await.unwrap();
        assert!(raw.contains("Mock response"));
        assert!(backend.is_available().await);
        assert_eq!(backend.name(), "Mock");
        assert_eq!(backend.model(), "mock-v1");
    }
}
