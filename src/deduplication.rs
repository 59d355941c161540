// 🔍 Duplicate Detector - staged candidates vs. the canonical ledger
//
// A candidate collides with a ledger row when the owner matches, the date is
// identical and the amounts differ by less than one cent. Matching
// candidates move PENDING → DUPLICATE and link the first (oldest) match.

use crate::documents::require_document;
use crate::error::Result;
use crate::ledger::{find_matches, LedgerTransaction, DUPLICATE_AMOUNT_TOLERANCE};
use crate::staging::{candidates_with_status, mark_duplicate, CandidateStatus};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFinding {
    pub pending_id: String,
    pub pending_description: String,
    pub pending_date: String,
    pub pending_amount: f64,
    /// Every ledger row that matched, oldest first; only the first is linked
    pub potential_duplicates: Vec<LedgerTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub document_id: String,
    pub total_checked: usize,
    pub duplicates_found: usize,
    pub duplicates: Vec<DuplicateFinding>,
}

// ============================================================================
// DETECTION
// ============================================================================

/// Amounts that differ by less than the tolerance are the same charge
pub fn is_duplicate_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < DUPLICATE_AMOUNT_TOLERANCE
}

/// Check every PENDING candidate of a document against `user_id`'s ledger
pub fn check_duplicates(conn: &Connection, document_id: &str, user_id: &str) -> Result<DuplicateReport> {
    require_document(conn, document_id)?;

    let pending = candidates_with_status(conn, document_id, CandidateStatus::Pending)?;
    let mut duplicates = Vec::new();

    for candidate in &pending {
        let matches: Vec<LedgerTransaction> = find_matches(conn, user_id, &candidate.date, candidate.amount)?
            .into_iter()
            .filter(|m| is_duplicate_amount(m.amount, candidate.amount))
            .collect();

        let first = match matches.first() {
            Some(first) => first,
            None => continue,
        };

        mark_duplicate(conn, &candidate.id, &first.id)?;

        duplicates.push(DuplicateFinding {
            pending_id: candidate.id.clone(),
            pending_description: candidate.description.clone(),
            pending_date: candidate.date.clone(),
            pending_amount: candidate.amount,
            potential_duplicates: matches,
        });
    }

    info!(
        document_id,
        checked = pending.len(),
        duplicates = duplicates.len(),
        "Duplicate check complete"
    );

    Ok(DuplicateReport {
        document_id: document_id.to_string(),
        total_checked: pending.len(),
        duplicates_found: duplicates.len(),
        duplicates,
    })
}

// ============================================================================
// TESTS
// ============================================================================
