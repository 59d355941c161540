// 📋 Staging store - candidate transactions awaiting human review
//
// PENDING → {APPROVED, REJECTED, DUPLICATE} → IMPORTED
// APPROVED may still be rejected. IMPORTED rows are never touched again.

use crate::db::{conversion_error, insert_event, now_rfc3339, Event};
use crate::error::{PipelineError, Result};
use crate::normalizer::{ExtractedTransaction, TransactionType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

const ACTOR: &str = "reviewer";
const NOT_REVIEWABLE: &str = "Transaction not found or not in pending status";

// ============================================================================
// CANDIDATE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    Pending,
    Approved,
    Rejected,
    Duplicate,
    Imported,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "PENDING",
            CandidateStatus::Approved => "APPROVED",
            CandidateStatus::Rejected => "REJECTED",
            CandidateStatus::Duplicate => "DUPLICATE",
            CandidateStatus::Imported => "IMPORTED",
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(CandidateStatus::Pending),
            "APPROVED" => Ok(CandidateStatus::Approved),
            "REJECTED" => Ok(CandidateStatus::Rejected),
            "DUPLICATE" => Ok(CandidateStatus::Duplicate),
            "IMPORTED" => Ok(CandidateStatus::Imported),
            other => Err(PipelineError::InvalidInput(format!("Unknown transaction status: {}", other))),
        }
    }
}

// ============================================================================
// CANDIDATE TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    pub id: String,
    pub document_id: String,
    pub date: String,
    pub description: String,
    pub original_description: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub category: Option<String>,
    pub suggested_categories: Vec<CategorySuggestion>,
    pub confidence: f64,
    pub line_number: Option<i64>,
    pub status: CandidateStatus,
    pub user_category: Option<String>,
    pub user_notes: Option<String>,
    pub duplicate_of_id: Option<String>,
    pub imported_transaction_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CandidateTransaction {
    /// The user's choice wins over the backend's suggestion
    pub fn effective_category(&self) -> Option<&str> {
        self.user_category.as_deref().or(self.category.as_deref())
    }
}

/// Reviewer edits; `None` leaves the field as it is
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateUpdate {
    pub description: Option<String>,
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
    pub category: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Approve,
    Reject,
    Delete,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Approve => "approve",
            BulkAction::Reject => "reject",
            BulkAction::Delete => "delete",
        }
    }
}

impl FromStr for BulkAction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(BulkAction::Approve),
            "reject" => Ok(BulkAction::Reject),
            "delete" => Ok(BulkAction::Delete),
            other => Err(PipelineError::InvalidInput(format!("Unknown bulk action: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub requested: usize,
    pub affected: usize,
    pub action: BulkAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusTotals {
    pub count: i64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub category: String,
    pub count: i64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub document_id: String,
    pub by_status: BTreeMap<CandidateStatus, StatusTotals>,
    pub by_category: Vec<CategoryTotals>,
    pub ready_to_import: i64,
}

const CANDIDATE_COLUMNS: &str = "id, document_id, date, description, original_description, amount,
    type, category, suggested_categories, confidence, line_number, status, user_category,
    user_notes, duplicate_of_id, imported_transaction_id, created_at, updated_at";

// ============================================================================
// WRITES
// ============================================================================

/// Persist one validated candidate as PENDING, returning its id
pub fn insert_candidate(conn: &Connection, document_id: &str, tx: &ExtractedTransaction) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();

    let suggestions: Vec<CategorySuggestion> = tx
        .category
        .iter()
        .map(|category| CategorySuggestion {
            category: category.clone(),
            confidence: tx.confidence,
        })
        .collect();

    conn.execute(
        "INSERT INTO pending_transactions (
            id, document_id, date, description, original_description, amount, type,
            category, suggested_categories, confidence, line_number, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'PENDING', ?12, ?12)",
        params![
            id,
            document_id,
            tx.date,
            tx.description,
            tx.original_description,
            tx.amount,
            tx.transaction_type.staging_code(),
            tx.category,
            serde_json::to_string(&suggestions)?,
            tx.confidence,
            tx.line_number as i64,
            now,
        ],
    )?;

    Ok(id)
}

/// Apply reviewer edits to a candidate that has not been imported
pub fn update_candidate(conn: &Connection, id: &str, update: &CandidateUpdate) -> Result<()> {
    let current = require_candidate(conn, id)?;
    if current.status == CandidateStatus::Imported {
        return Err(PipelineError::InvalidState(
            "Imported transactions cannot be modified".to_string(),
        ));
    }

    if let Some(amount) = update.amount {
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(PipelineError::InvalidInput("Amount must be greater than zero".to_string()));
        }
    }

    let tx_type = update
        .transaction_type
        .as_deref()
        .map(|t| t.parse::<TransactionType>().map_err(PipelineError::InvalidInput))
        .transpose()?;

    conn.execute(
        "UPDATE pending_transactions
         SET description = COALESCE(?2, description),
             amount = COALESCE(?3, amount),
             type = COALESCE(?4, type),
             user_category = COALESCE(?5, user_category),
             user_notes = COALESCE(?6, user_notes),
             updated_at = ?7
         WHERE id = ?1 AND status != 'IMPORTED'",
        params![
            id,
            update.description,
            update.amount,
            tx_type.map(|t| t.staging_code()),
            update.category,
            update.notes,
            now_rfc3339(),
        ],
    )?;

    Ok(())
}

/// PENDING → APPROVED
pub fn approve(conn: &Connection, id: &str) -> Result<()> {
    if !try_approve(conn, id)? {
        return Err(PipelineError::InvalidState(NOT_REVIEWABLE.to_string()));
    }
    Ok(())
}

/// PENDING | APPROVED → REJECTED
pub fn reject(conn: &Connection, id: &str) -> Result<()> {
    if !try_reject(conn, id)? {
        return Err(PipelineError::InvalidState(NOT_REVIEWABLE.to_string()));
    }
    Ok(())
}

fn try_approve(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pending_transactions SET status = 'APPROVED', updated_at = ?2
         WHERE id = ?1 AND status = 'PENDING'",
        params![id, now_rfc3339()],
    )?;

    if changed == 1 {
        insert_event(conn, &Event::status_change("candidate", id, "PENDING", "APPROVED", ACTOR))?;
    }
    Ok(changed == 1)
}

fn try_reject(conn: &Connection, id: &str) -> Result<bool> {
    let previous: Option<String> = conn
        .query_row(
            "SELECT status FROM pending_transactions WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    let changed = conn.execute(
        "UPDATE pending_transactions SET status = 'REJECTED', updated_at = ?2
         WHERE id = ?1 AND status IN ('PENDING', 'APPROVED')",
        params![id, now_rfc3339()],
    )?;

    if changed == 1 {
        let from = previous.unwrap_or_else(|| "PENDING".to_string());
        insert_event(conn, &Event::status_change("candidate", id, &from, "REJECTED", ACTOR))?;
    }
    Ok(changed == 1)
}

fn try_delete(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM pending_transactions WHERE id = ?1 AND status != 'IMPORTED'",
        [id],
    )?;

    if changed == 1 {
        insert_event(
            conn,
            &Event::new("candidate_deleted", "candidate", id, serde_json::json!({}), ACTOR),
        )?;
    }
    Ok(changed == 1)
}

/// Apply one action to many candidates. Ids that fail the per-row guard are
/// skipped and simply not counted in `affected`.
pub fn bulk(conn: &Connection, ids: &[String], action: BulkAction) -> Result<BulkOutcome> {
    if ids.is_empty() {
        return Err(PipelineError::InvalidInput("No transaction ids provided".to_string()));
    }

    let mut affected = 0;
    for id in ids {
        let applied = match action {
            BulkAction::Approve => try_approve(conn, id)?,
            BulkAction::Reject => try_reject(conn, id)?,
            BulkAction::Delete => try_delete(conn, id)?,
        };
        if applied {
            affected += 1;
        }
    }

    info!(action = action.as_str(), requested = ids.len(), affected, "Bulk review action applied");

    Ok(BulkOutcome {
        requested: ids.len(),
        affected,
        action,
    })
}

/// PENDING → DUPLICATE, linking the matching ledger row
pub fn mark_duplicate(conn: &Connection, id: &str, ledger_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pending_transactions SET status = 'DUPLICATE', duplicate_of_id = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'PENDING'",
        params![id, ledger_id, now_rfc3339()],
    )?;

    if changed == 1 {
        insert_event(
            conn,
            &Event::status_change("candidate", id, "PENDING", "DUPLICATE", "duplicate_detector"),
        )?;
    }
    Ok(changed == 1)
}

/// APPROVED → IMPORTED. The link is written once; a second call changes nothing.
pub fn mark_imported(conn: &Connection, id: &str, ledger_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pending_transactions
         SET status = 'IMPORTED', imported_transaction_id = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'APPROVED' AND imported_transaction_id IS NULL",
        params![id, ledger_id, now_rfc3339()],
    )?;

    if changed == 1 {
        insert_event(
            conn,
            &Event::status_change("candidate", id, "APPROVED", "IMPORTED", "import_committer"),
        )?;
    }
    Ok(changed == 1)
}

// ============================================================================
// READS
// ============================================================================

pub fn get_candidate(conn: &Connection, id: &str) -> Result<Option<CandidateTransaction>> {
    let sql = format!("SELECT {} FROM pending_transactions WHERE id = ?1", CANDIDATE_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_candidate).optional()?)
}

pub fn require_candidate(conn: &Connection, id: &str) -> Result<CandidateTransaction> {
    get_candidate(conn, id)?.ok_or_else(|| PipelineError::NotFound("Transaction".to_string()))
}

/// Candidates of a document, ordered by date then statement line
pub fn candidates_for_document(conn: &Connection, document_id: &str) -> Result<Vec<CandidateTransaction>> {
    query_candidates(conn, document_id, None)
}

/// Candidates of a document in one status
pub fn candidates_with_status(
    conn: &Connection,
    document_id: &str,
    status: CandidateStatus,
) -> Result<Vec<CandidateTransaction>> {
    query_candidates(conn, document_id, Some(status))
}

fn query_candidates(
    conn: &Connection,
    document_id: &str,
    status: Option<CandidateStatus>,
) -> Result<Vec<CandidateTransaction>> {
    let sql = format!(
        "SELECT {} FROM pending_transactions
         WHERE document_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY date, line_number",
        CANDIDATE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![document_id, status.map(|s| s.as_str())], row_to_candidate)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Review progress of one document
pub fn summary(conn: &Connection, document_id: &str) -> Result<ReviewSummary> {
    let candidates = candidates_for_document(conn, document_id)?;

    let mut by_status: BTreeMap<CandidateStatus, StatusTotals> = BTreeMap::new();
    let mut by_category: BTreeMap<String, CategoryTotals> = BTreeMap::new();

    for candidate in &candidates {
        let entry = by_status.entry(candidate.status).or_default();
        entry.count += 1;
        entry.total += candidate.amount;

        if matches!(candidate.status, CandidateStatus::Pending | CandidateStatus::Approved) {
            let name = candidate.effective_category().unwrap_or("Uncategorized").to_string();
            let entry = by_category.entry(name.clone()).or_insert_with(|| CategoryTotals {
                category: name,
                count: 0,
                total: 0.0,
            });
            entry.count += 1;
            entry.total += candidate.amount;
        }
    }

    let ready_to_import = by_status
        .get(&CandidateStatus::Approved)
        .map(|t| t.count)
        .unwrap_or(0);

    let mut by_category: Vec<CategoryTotals> = by_category.into_values().collect();
    by_category.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.category.cmp(&b.category)));

    Ok(ReviewSummary {
        document_id: document_id.to_string(),
        by_status,
        by_category,
        ready_to_import,
    })
}

fn row_to_candidate(row: &Row<'_>) -> rusqlite::Result<CandidateTransaction> {
    let type_str: String = row.get(6)?;
    let transaction_type = type_str
        .parse::<TransactionType>()
        .map_err(|e| conversion_error(6, PipelineError::InvalidInput(e)))?;

    let suggestions_json: String = row.get(8)?;
    let suggested_categories =
        serde_json::from_str(&suggestions_json).map_err(|e| conversion_error(8, e))?;

    let status_str: String = row.get(11)?;
    let status = status_str
        .parse::<CandidateStatus>()
        .map_err(|e| conversion_error(11, e))?;

    Ok(CandidateTransaction {
        id: row.get(0)?,
        document_id: row.get(1)?,
        date: row.get(2)?,
        description: row.get(3)?,
        original_description: row.get(4)?,
        amount: row.get(5)?,
        transaction_type,
        category: row.get(7)?,
        suggested_categories,
        confidence: row.get(9)?,
        line_number: row.get(10)?,
        status,
        user_category: row.get(12)?,
        user_notes: row.get(13)?,
        duplicate_of_id: row.get(14)?,
        imported_transaction_id: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
