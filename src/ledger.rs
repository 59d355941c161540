// 📒 Canonical ledger contract
//
// The ledger belongs to the wider application. This core only needs two
// things from it: a duplicate lookup and an insert during import.

use crate::db::now_rfc3339;
use crate::error::Result;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// Amounts closer than this are considered the same transaction
pub const DUPLICATE_AMOUNT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub user_id: String,
    pub description: String,
    pub amount: f64,
    /// Ledger encoding: "expense" | "income"
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub category: String,
    pub date: String,
    pub budget_id: Option<String>,
    pub created_at: String,
}

/// Fields needed to create a ledger row
#[derive(Debug, Clone)]
pub struct NewLedgerTransaction<'a> {
    pub user_id: &'a str,
    pub description: &'a str,
    pub amount: f64,
    pub transaction_type: &'a str,
    pub category: &'a str,
    pub date: &'a str,
    pub budget_id: Option<&'a str>,
}

/// Insert a ledger row and return its new id
pub fn insert_ledger_transaction(conn: &Connection, tx: &NewLedgerTransaction<'_>) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO transactions (
            id, user_id, description, amount, type, category, date, budget_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            id,
            tx.user_id,
            tx.description,
            tx.amount,
            tx.transaction_type,
            tx.category,
            tx.date,
            tx.budget_id,
            now,
        ],
    )?;

    Ok(id)
}

/// Ledger rows of `user_id` on `date` whose amount is within tolerance of
/// `amount`, oldest first
pub fn find_matches(conn: &Connection, user_id: &str, date: &str, amount: f64) -> Result<Vec<LedgerTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, description, amount, type, category, date, budget_id, created_at
         FROM transactions
         WHERE user_id = ?1 AND date = ?2 AND ABS(amount - ?3) < ?4
         ORDER BY created_at, rowid",
    )?;

    let rows = stmt
        .query_map(
            params![user_id, date, amount, DUPLICATE_AMOUNT_TOLERANCE],
            row_to_ledger,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn get_ledger_transaction(conn: &Connection, id: &str) -> Result<Option<LedgerTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, description, amount, type, category, date, budget_id, created_at
         FROM transactions WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map([id], row_to_ledger)?;
    Ok(rows.next().transpose()?)
}

pub fn count_for_user(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?)
}

fn row_to_ledger(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        description: row.get(2)?,
        amount: row.get(3)?,
        transaction_type: row.get(4)?,
        category: row.get(5)?,
        date: row.get(6)?,
        budget_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}
