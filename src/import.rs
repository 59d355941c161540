// 📥 Import Committer - approved candidates → canonical ledger
//
// One SQLite transaction per import: either every approved candidate lands
// in the ledger (and is marked IMPORTED) or nothing does.

use crate::documents::{mark_imported as mark_document_imported, require_document};
use crate::error::{PipelineError, Result};
use crate::ledger::{insert_ledger_transaction, NewLedgerTransaction};
use crate::staging::{candidates_with_status, mark_imported, CandidateStatus};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Category used when neither the reviewer nor the backend picked one
pub const FALLBACK_CATEGORY: &str = "Other";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub document_id: String,
    pub imported_count: usize,
    pub transaction_ids: Vec<String>,
}

/// Move every APPROVED candidate of `document_id` into the ledger
pub fn import_approved(conn: &mut Connection, document_id: &str, budget_id: Option<&str>) -> Result<ImportOutcome> {
    let tx = conn.transaction()?;

    let document = require_document(&tx, document_id)?;
    let approved = candidates_with_status(&tx, document_id, CandidateStatus::Approved)?;
    if approved.is_empty() {
        return Err(PipelineError::InvalidState("No approved transactions to import".to_string()));
    }

    let mut transaction_ids = Vec::with_capacity(approved.len());
    for candidate in &approved {
        let ledger_id = insert_ledger_transaction(
            &tx,
            &NewLedgerTransaction {
                user_id: &document.user_id,
                description: &candidate.description,
                amount: candidate.amount,
                transaction_type: candidate.transaction_type.as_str(),
                category: candidate.effective_category().unwrap_or(FALLBACK_CATEGORY),
                date: &candidate.date,
                budget_id,
            },
        )?;

        if !mark_imported(&tx, &candidate.id, &ledger_id)? {
            // concurrently imported or un-approved; the rollback undoes the ledger rows
            return Err(PipelineError::InvalidState(format!(
                "Transaction {} changed during import",
                candidate.id
            )));
        }
        transaction_ids.push(ledger_id);
    }

    mark_document_imported(&tx, document_id)?;
    tx.commit()?;

    info!(document_id, imported = transaction_ids.len(), "Imported approved transactions");

    Ok(ImportOutcome {
        document_id: document_id.to_string(),
        imported_count: transaction_ids.len(),
        transaction_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_database, status_history};
    use crate::documents::{
        claim_for_processing, get_document, insert_document, mark_extracted, tests::new_document,
        DocumentStatus, ExtractedFields,
    };
    use crate::ledger::{count_for_user, get_ledger_transaction};
    use crate::staging::{approve, insert_candidate, reject, require_candidate, tests::extracted, update_candidate, CandidateUpdate};

    fn extracted_document() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();
        claim_for_processing(&conn, "doc-1").unwrap();
        mark_extracted(
            &conn,
            "doc-1",
            &ExtractedFields {
                extracted_data: &serde_json::json!({}),
                transaction_count: 5,
                llm_provider: "Mock",
                llm_model: "mock-v1",
                processing_time_ms: 1,
                statement_start_date: None,
                statement_end_date: None,
            },
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_imports_only_approved() {
        let mut conn = extracted_document();
        let ids: Vec<String> = (1..=5)
            .map(|i| {
                let category = if i == 1 { Some("Dining") } else { None };
                insert_candidate(&conn, "doc-1", &extracted("2024-01-05", 10.0 * i as f64, category, i)).unwrap()
            })
            .collect();

        for id in &ids[..3] {
            approve(&conn, id).unwrap();
        }
        reject(&conn, &ids[3]).unwrap();
        update_candidate(
            &conn,
            &ids[1],
            &CandidateUpdate { category: Some("Groceries".to_string()), ..Default::default() },
        )
        .unwrap();

        let outcome = import_approved(&mut conn, "doc-1", Some("budget-9")).unwrap();
        assert_eq!(outcome.imported_count, 3);
        assert_eq!(count_for_user(&conn, "user-1").unwrap(), 3);

        let categories: Vec<String> = ids[..3]
            .iter()
            .map(|id| {
                let candidate = require_candidate(&conn, id).unwrap();
                assert_eq!(candidate.status, CandidateStatus::Imported);
                let ledger_id = candidate.imported_transaction_id.unwrap();
                assert!(outcome.transaction_ids.contains(&ledger_id));

                let row = get_ledger_transaction(&conn, &ledger_id).unwrap().unwrap();
                assert_eq!(row.transaction_type, "expense");
                assert_eq!(row.budget_id.as_deref(), Some("budget-9"));
                row.category
            })
            .collect();
        assert_eq!(categories, vec!["Dining", "Groceries", "Other"]);

        assert_eq!(require_candidate(&conn, &ids[3]).unwrap().status, CandidateStatus::Rejected);
        assert_eq!(require_candidate(&conn, &ids[4]).unwrap().status, CandidateStatus::Pending);

        let doc = get_document(&conn, "doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Imported);
        assert_eq!(
            status_history(&conn, "candidate", &ids[0]).unwrap(),
            vec!["PENDING", "APPROVED", "IMPORTED"]
        );
    }

    #[test]
    fn test_nothing_approved() {
        let mut conn = extracted_document();
        insert_candidate(&conn, "doc-1", &extracted("2024-01-05", 10.0, None, 1)).unwrap();

        let err = import_approved(&mut conn, "doc-1", None).unwrap_err();
        assert_eq!(err.to_string(), "No approved transactions to import");
        assert_eq!(count_for_user(&conn, "user-1").unwrap(), 0);
        assert_eq!(get_document(&conn, "doc-1").unwrap().unwrap().status, DocumentStatus::Extracted);
    }

    #[test]
    fn test_second_import_finds_nothing() {
        let mut conn = extracted_document();
        let id = insert_candidate(&conn, "doc-1", &extracted("2024-01-05", 10.0, None, 1)).unwrap();
        approve(&conn, &id).unwrap();

        import_approved(&mut conn, "doc-1", None).unwrap();
        assert!(import_approved(&mut conn, "doc-1", None).is_err());
        assert_eq!(count_for_user(&conn, "user-1").unwrap(), 1);
    }

    #[test]
    fn test_late_approval_on_imported_document() {
        let mut conn = extracted_document();
        let first = insert_candidate(&conn, "doc-1", &extracted("2024-01-05", 10.0, None, 1)).unwrap();
        let later = insert_candidate(&conn, "doc-1", &extracted("2024-01-06", 12.0, None, 2)).unwrap();
        approve(&conn, &first).unwrap();
        import_approved(&mut conn, "doc-1", None).unwrap();

        approve(&conn, &later).unwrap();
        let outcome = import_approved(&mut conn, "doc-1", None).unwrap();
        assert_eq!(outcome.imported_count, 1);
        assert_eq!(count_for_user(&conn, "user-1").unwrap(), 2);
    }

    #[test]
    fn test_pending_document_cannot_import() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_document(&conn, &new_document("doc-1", "user-1")).unwrap();
        let id = insert_candidate(&conn, "doc-1", &extracted("2024-01-05", 10.0, None, 1)).unwrap();
        approve(&conn, &id).unwrap();

        // the document guard fails, so the whole batch rolls back
        assert!(matches!(
            import_approved(&mut conn, "doc-1", None),
            Err(PipelineError::InvalidState(_))
        ));
        assert_eq!(count_for_user(&conn, "user-1").unwrap(), 0);
        assert_eq!(require_candidate(&conn, &id).unwrap().status, CandidateStatus::Approved);
    }

    #[test]
    fn test_missing_document() {
        let mut conn = extracted_document();
        assert!(matches!(
            import_approved(&mut conn, "missing", None),
            Err(PipelineError::NotFound(_))
        ));
    }
}
