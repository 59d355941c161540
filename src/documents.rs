// 📄 Document store - uploaded statements and their lifecycle status
//
// PENDING → PROCESSING → {EXTRACTED | FAILED} → IMPORTED
// FAILED may re-enter PROCESSING. Every write below is guarded by the
// status it expects, so a stale caller can never move a document backwards.

use crate::db::{conversion_error, insert_event, now_rfc3339, Event};
use crate::error::{PipelineError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ACTOR: &str = "document_pipeline";

// ============================================================================
// DOCUMENT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Extracted,
    Failed,
    Imported,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Extracted => "EXTRACTED",
            DocumentStatus::Failed => "FAILED",
            DocumentStatus::Imported => "IMPORTED",
        }
    }

    /// Whether `process` may claim a document in this status
    pub fn is_processable(&self) -> bool {
        matches!(self, DocumentStatus::Pending | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(DocumentStatus::Pending),
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "EXTRACTED" => Ok(DocumentStatus::Extracted),
            "FAILED" => Ok(DocumentStatus::Failed),
            "IMPORTED" => Ok(DocumentStatus::Imported),
            other => Err(PipelineError::InvalidInput(format!("Unknown document status: {}", other))),
        }
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub original_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub file_path: String,
    pub checksum: String,
    pub status: DocumentStatus,
    pub bank_account_id: Option<String>,
    pub user_id: String,
    /// Full extraction result, including the raw backend response
    pub extracted_data: Option<serde_json::Value>,
    pub transaction_count: i64,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub statement_start_date: Option<String>,
    pub statement_end_date: Option<String>,
    pub processing_error: Option<String>,
    pub uploaded_at: String,
    pub processed_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub filename: String,
    pub original_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub file_path: String,
    pub checksum: String,
    pub bank_account_id: Option<String>,
    pub user_id: String,
}

/// Values written when extraction succeeds
#[derive(Debug, Clone)]
pub struct ExtractedFields<'a> {
    pub extracted_data: &'a serde_json::Value,
    pub transaction_count: i64,
    pub llm_provider: &'a str,
    pub llm_model: &'a str,
    pub processing_time_ms: i64,
    pub statement_start_date: Option<&'a str>,
    pub statement_end_date: Option<&'a str>,
}

/// Values written when extraction fails
#[derive(Debug, Clone)]
pub struct FailedFields<'a> {
    pub error: &'a str,
    pub llm_provider: Option<&'a str>,
    pub llm_model: Option<&'a str>,
    pub processing_time_ms: i64,
    pub extracted_data: Option<&'a serde_json::Value>,
}

/// Result of trying to claim a document for processing
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Claimed { previous: DocumentStatus },
    Rejected { current: DocumentStatus },
    NotFound,
}

const DOCUMENT_COLUMNS: &str = "id, filename, original_name, file_size, mime_type, file_path, checksum,
    status, bank_account_id, user_id, extracted_data, transaction_count, llm_provider, llm_model,
    processing_time_ms, statement_start_date, statement_end_date, processing_error,
    uploaded_at, processed_at, updated_at";

pub fn insert_document(conn: &Connection, doc: &NewDocument) -> Result<()> {
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO bank_documents (
            id, filename, original_name, file_size, mime_type, file_path, checksum,
            status, bank_account_id, user_id, uploaded_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?9, ?10, ?10)",
        params![
            doc.id,
            doc.filename,
            doc.original_name,
            doc.file_size,
            doc.mime_type,
            doc.file_path,
            doc.checksum,
            doc.bank_account_id,
            doc.user_id,
            now,
        ],
    )?;

    insert_event(
        conn,
        &Event::new(
            "document_uploaded",
            "document",
            &doc.id,
            serde_json::json!({
                "original_name": doc.original_name,
                "file_size": doc.file_size,
                "user_id": doc.user_id,
            }),
            ACTOR,
        ),
    )?;

    Ok(())
}

pub fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM bank_documents WHERE id = ?1", DOCUMENT_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_document).optional()?)
}

/// Like `get_document` but a missing row is an error
pub fn require_document(conn: &Connection, id: &str) -> Result<Document> {
    get_document(conn, id)?.ok_or_else(|| PipelineError::NotFound("Document".to_string()))
}

/// All documents of a user, newest upload first
pub fn list_documents_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM bank_documents WHERE user_id = ?1 ORDER BY uploaded_at DESC, rowid DESC",
        DOCUMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map([user_id], row_to_document)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs)
}

/// Atomically move a PENDING/FAILED document to PROCESSING.
///
/// The status check and the write are one conditional UPDATE, so two
/// concurrent callers can never both claim the same document.
pub fn claim_for_processing(conn: &Connection, id: &str) -> Result<Claim> {
    let before = match get_document(conn, id)? {
        Some(doc) => doc.status,
        None => return Ok(Claim::NotFound),
    };

    let changed = conn.execute(
        "UPDATE bank_documents
         SET status = 'PROCESSING', processing_error = NULL, updated_at = ?2
         WHERE id = ?1 AND status IN ('PENDING', 'FAILED')",
        params![id, now_rfc3339()],
    )?;

    if changed == 0 {
        let current = require_document(conn, id)?.status;
        return Ok(Claim::Rejected { current });
    }

    let previous = if before.is_processable() { before } else { DocumentStatus::Pending };
    insert_event(
        conn,
        &Event::status_change("document", id, previous.as_str(), "PROCESSING", ACTOR),
    )?;

    Ok(Claim::Claimed { previous })
}

/// PROCESSING → EXTRACTED
pub fn mark_extracted(conn: &Connection, id: &str, fields: &ExtractedFields<'_>) -> Result<()> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE bank_documents
         SET status = 'EXTRACTED',
             extracted_data = ?2,
             transaction_count = ?3,
             llm_provider = ?4,
             llm_model = ?5,
             processing_time_ms = ?6,
             statement_start_date = ?7,
             statement_end_date = ?8,
             processing_error = NULL,
             processed_at = ?9,
             updated_at = ?9
         WHERE id = ?1 AND status = 'PROCESSING'",
        params![
            id,
            serde_json::to_string(fields.extracted_data)?,
            fields.transaction_count,
            fields.llm_provider,
            fields.llm_model,
            fields.processing_time_ms,
            fields.statement_start_date,
            fields.statement_end_date,
            now,
        ],
    )?;

    ensure_transitioned(conn, id, changed, DocumentStatus::Extracted)
}

/// PROCESSING → FAILED, keeping the error text for the user
pub fn mark_failed(conn: &Connection, id: &str, fields: &FailedFields<'_>) -> Result<()> {
    let now = now_rfc3339();
    let extracted = fields.extracted_data.map(serde_json::to_string).transpose()?;

    let changed = conn.execute(
        "UPDATE bank_documents
         SET status = 'FAILED',
             processing_error = ?2,
             llm_provider = COALESCE(?3, llm_provider),
             llm_model = COALESCE(?4, llm_model),
             processing_time_ms = ?5,
             extracted_data = COALESCE(?6, extracted_data),
             transaction_count = 0,
             processed_at = ?7,
             updated_at = ?7
         WHERE id = ?1 AND status = 'PROCESSING'",
        params![
            id,
            fields.error,
            fields.llm_provider,
            fields.llm_model,
            fields.processing_time_ms,
            extracted,
            now,
        ],
    )?;

    ensure_transitioned(conn, id, changed, DocumentStatus::Failed)
}

/// EXTRACTED → IMPORTED. A document that is already IMPORTED stays so
/// (later imports of newly approved candidates are allowed).
pub fn mark_imported(conn: &Connection, id: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bank_documents SET status = 'IMPORTED', updated_at = ?2
         WHERE id = ?1 AND status = 'EXTRACTED'",
        params![id, now_rfc3339()],
    )?;

    if changed == 1 {
        insert_event(
            conn,
            &Event::status_change("document", id, "EXTRACTED", "IMPORTED", ACTOR),
        )?;
        return Ok(());
    }

    match require_document(conn, id)?.status {
        DocumentStatus::Imported => Ok(()),
        other => Err(PipelineError::InvalidState(format!(
            "Document cannot be imported (status: {})",
            other
        ))),
    }
}

fn ensure_transitioned(conn: &Connection, id: &str, changed: usize, to: DocumentStatus) -> Result<()> {
    if changed == 0 {
        let current = require_document(conn, id)?.status;
        return Err(PipelineError::InvalidState(format!(
            "Document cannot move from {} to {}",
            current, to
        )));
    }

    insert_event(
        conn,
        &Event::status_change("document", id, "PROCESSING", to.as_str(), ACTOR),
    )
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let status_str: String = row.get(7)?;
    let status = status_str
        .parse::<DocumentStatus>()
        .map_err(|e| conversion_error(7, e))?;

    let extracted_json: Option<String> = row.get(10)?;
    let extracted_data = extracted_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;

    Ok(Document {
        id: row.get(0)?,
        filename: row.get(1)?,
        original_name: row.get(2)?,
        file_size: row.get(3)?,
        mime_type: row.get(4)?,
        file_path: row.get(5)?,
        checksum: row.get(6)?,
        status,
        bank_account_id: row.get(8)?,
        user_id: row.get(9)?,
        extracted_data,
        transaction_count: row.get(11)?,
        llm_provider: row.get(12)?,
        llm_model: row.get(13)?,
        processing_time_ms: row.get(14)?,
        statement_start_date: row.get(15)?,
        statement_end_date: row.get(16)?,
        processing_error: row.get(17)?,
        uploaded_at: row.get(18)?,
        processed_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{setup_database, status_history};

    pub(crate) fn new_document(id: &str, user: &str) -> NewDocument {
        NewDocument {
            id: id.to_string(),
            filename: format!("{}.pdf", id),
            original_name: "statement.pdf".to_string(),
            file_size: 1024,
            mime_type: "application/pdf".to_string(),
            file_path: format!("/tmp/{}.pdf", id),
            checksum: "abc".to_string(),
            bank_account_id: None,
            user_id: user.to_string(),
        }
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn failed_fields() -> FailedFields<'static> {
        FailedFields {
            error: "boom",
            llm_provider: Some("Mock"),
            llm_model: None,
            processing_time_ms: 5,
            extracted_data: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Extracted,
            DocumentStatus::Failed,
            DocumentStatus::Imported,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();

        let doc = get_document(&conn, "doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.user_id, "user-1");
        assert_eq!(doc.transaction_count, 0);
        assert!(doc.extracted_data.is_none());

        assert!(get_document(&conn, "nope").unwrap().is_none());
        assert!(matches!(
            require_document(&conn, "nope"),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_claim_only_once() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();

        assert_eq!(
            claim_for_processing(&conn, "doc-1").unwrap(),
            Claim::Claimed { previous: DocumentStatus::Pending }
        );
        // second caller loses the race
        assert_eq!(
            claim_for_processing(&conn, "doc-1").unwrap(),
            Claim::Rejected { current: DocumentStatus::Processing }
        );
        assert_eq!(claim_for_processing(&conn, "missing").unwrap(), Claim::NotFound);
    }

    #[test]
    fn test_failed_can_be_reclaimed() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();
        claim_for_processing(&conn, "doc-1").unwrap();
        mark_failed(&conn, "doc-1", &failed_fields()).unwrap();

        let doc = get_document(&conn, "doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.processing_error.as_deref(), Some("boom"));

        assert_eq!(
            claim_for_processing(&conn, "doc-1").unwrap(),
            Claim::Claimed { previous: DocumentStatus::Failed }
        );
        let doc = get_document(&conn, "doc-1").unwrap().unwrap();
        assert!(doc.processing_error.is_none(), "claim clears the previous error");
    }

    #[test]
    fn test_guarded_writes() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();

        // not PROCESSING yet
        assert!(matches!(
            mark_failed(&conn, "doc-1", &failed_fields()),
            Err(PipelineError::InvalidState(_))
        ));
        assert!(matches!(
            mark_imported(&conn, "doc-1"),
            Err(PipelineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_full_lifecycle_history() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();
        claim_for_processing(&conn, "doc-1").unwrap();

        let payload = serde_json::json!({"success": true});
        mark_extracted(
            &conn,
            "doc-1",
            &ExtractedFields {
                extracted_data: &payload,
                transaction_count: 3,
                llm_provider: "Mock",
                llm_model: "mock-v1",
                processing_time_ms: 12,
                statement_start_date: Some("2024-01-01"),
                statement_end_date: Some("2024-01-31"),
            },
        )
        .unwrap();
        mark_imported(&conn, "doc-1").unwrap();
        // idempotent once imported
        mark_imported(&conn, "doc-1").unwrap();

        let doc = get_document(&conn, "doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Imported);
        assert_eq!(doc.transaction_count, 3);
        assert_eq!(doc.extracted_data, Some(payload));
        assert_eq!(doc.statement_end_date.as_deref(), Some("2024-01-31"));

        let history = status_history(&conn, "document", "doc-1").unwrap();
        assert_eq!(history, vec!["PENDING", "PROCESSING", "EXTRACTED", "IMPORTED"]);
    }

    #[test]
    fn test_list_documents_for_user() {
        let conn = setup();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();
        insert_document(&conn, &new_document("doc-2", "user-1")).unwrap();
        insert_document(&conn, &new_document("doc-3", "user-2")).unwrap();

        let docs = list_documents_for_user(&conn, "user-1").unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.user_id == "user-1"));
    }
}
