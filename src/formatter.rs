// 📝 Formatter - extracted PDF content → backend prompt text
//
// Everything here is a pure function of its input.

use crate::pdf::PdfContent;

/// Rows emitted per table
pub const MAX_TABLE_ROWS: usize = 50;

/// Document text beyond this many characters is cut
pub const MAX_PROMPT_CHARS: usize = 50_000;

pub const TRUNCATION_MARKER: &str = "[Document truncated due to length]";

/// Categories the backend is asked to choose from
pub const TRANSACTION_CATEGORIES: &[&str] = &[
    "Groceries",
    "Dining",
    "Transportation",
    "Utilities",
    "Entertainment",
    "Shopping",
    "Healthcare",
    "Subscriptions",
    "Travel",
    "Housing",
    "Insurance",
    "Education",
    "Personal Care",
    "Gifts & Donations",
    "Income",
    "Transfer",
    "Fees & Charges",
    "Other",
];

/// Render page text and tables in a layout backends parse reliably
pub fn format_for_backend(content: &PdfContent) -> String {
    let mut out = String::new();
    out.push_str("=== BANK STATEMENT DOCUMENT ===\n");
    out.push_str(&format!("Total Pages: {}\n", content.total_pages));

    for page in &content.pages {
        out.push_str(&format!("\n--- PAGE {} ---\n", page.page_number));
        out.push_str(&page.text);
        out.push('\n');

        if page.tables.is_empty() {
            continue;
        }

        out.push_str("\n[TABLES ON THIS PAGE]\n");
        for (idx, table) in page.tables.iter().enumerate() {
            out.push_str(&format!("Table {}:\n", idx + 1));
            for row in table.iter().take(MAX_TABLE_ROWS) {
                out.push_str(&row.join(" | "));
                out.push('\n');
            }
        }
    }

    out
}

/// User message wrapping the formatted document
pub fn build_extraction_prompt(document_text: &str) -> String {
    let document = truncate_document(document_text);
    format!(
        "Please extract all transactions from this bank statement.\n\n{}\n\nExtract every transaction you can find and return the JSON response.",
        document
    )
}

fn truncate_document(text: &str) -> String {
    match text.char_indices().nth(MAX_PROMPT_CHARS) {
        Some((cut, _)) => format!("{}\n\n{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Extraction rules, category list and output contract
pub fn system_prompt() -> String {
    format!(
        r#"You are a financial document parser specializing in bank statement extraction.
Your task is to extract transaction data from bank statements accurately.

IMPORTANT RULES:
1. Extract ALL transactions you can find in the document
2. Dates should be in YYYY-MM-DD format
3. Amounts should be positive numbers (indicate income/expense in the type field)
4. Identify the transaction type: 'expense' for charges/purchases, 'income' for credits/deposits
5. Categorize each transaction using these categories: {}
6. Include confidence scores (0.0 to 1.0) based on how certain you are about each extraction
7. Preserve the original description exactly as it appears

OUTPUT FORMAT (JSON):
{{
  "statement_info": {{
    "bank_name": "string or null",
    "account_type": "credit_card|checking|savings|null",
    "last_four": "string (last 4 digits) or null",
    "statement_start": "YYYY-MM-DD or null",
    "statement_end": "YYYY-MM-DD or null"
  }},
  "transactions": [
    {{
      "date": "YYYY-MM-DD",
      "description": "cleaned description",
      "original_description": "exact text from statement",
      "amount": 123.45,
      "type": "expense|income",
      "category": "category name",
      "confidence": 0.95
    }}
  ]
}}"#,
        TRANSACTION_CATEGORIES.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::PdfPage;
    use std::collections::BTreeMap;

    fn content(pages: Vec<PdfPage>) -> PdfContent {
        PdfContent {
            total_pages: pages.len(),
            pages,
            metadata: BTreeMap::new(),
        }
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_layout() {
        let doc = content(vec![
            PdfPage {
                page_number: 1,
                text: "ACME BANK".to_string(),
                tables: vec![vec![row(&["Date", "Amount"]), row(&["01/05", "4.50"])]],
            },
            PdfPage {
                page_number: 2,
                text: "Thanks for banking".to_string(),
                tables: vec![],
            },
        ]);

        let expected = "=== BANK STATEMENT DOCUMENT ===\n\
Total Pages: 2\n\
\n--- PAGE 1 ---\n\
ACME BANK\n\
\n[TABLES ON THIS PAGE]\n\
Table 1:\n\
Date | Amount\n\
01/05 | 4.50\n\
\n--- PAGE 2 ---\n\
Thanks for banking\n";

        assert_eq!(format_for_backend(&doc), expected);
    }

    #[test]
    fn test_table_rows_capped() {
        let table: Vec<Vec<String>> = (0..80).map(|i| row(&[&i.to_string(), "x"])).collect();
        let doc = content(vec![PdfPage {
            page_number: 1,
            text: String::new(),
            tables: vec![table],
        }]);

        let out = format_for_backend(&doc);
        assert!(out.contains("49 | x"));
        assert!(!out.contains("50 | x"));
        // deterministic
        assert_eq!(out, format_for_backend(&doc));
    }

    #[test]
    fn test_prompt_truncation() {
        let short = build_extraction_prompt("tiny");
        assert!(short.contains("tiny"));
        assert!(!short.contains(TRUNCATION_MARKER));

        let long = "é".repeat(MAX_PROMPT_CHARS + 10);
        let prompt = build_extraction_prompt(&long);
        assert!(prompt.contains(TRUNCATION_MARKER));
        assert_eq!(prompt.matches('é').count(), MAX_PROMPT_CHARS);
    }

    #[test]
    fn test_system_prompt_lists_categories() {
        let prompt = system_prompt();
        assert!(prompt.contains("Gifts & Donations, Income, Transfer, Fees & Charges, Other"));
        assert!(prompt.contains("\"statement_info\": {"));
        assert_eq!(TRANSACTION_CATEGORIES.len(), 18);
    }
}
