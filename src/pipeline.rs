// 🔄 Document pipeline - upload → claim → extract → stage
//
// Flow for one document:
// 1. upload: validate, store the binary, insert PENDING
// 2. process: resolve backend, atomically claim (PROCESSING), then
//    pdf → formatter → backend → normalizer
// 3. success: candidates + EXTRACTED in one transaction
//    failure: FAILED with the error text (and raw backend output if any)
//
// Review, duplicate and import operations are thin wrappers that run the
// store functions against the shared Database handle.

use crate::backends::{BackendKind, BackendRegistry, CompletionRequest, ExtractionBackend};
use crate::config::Config;
use crate::db::Database;
use crate::deduplication::{check_duplicates, DuplicateReport};
use crate::documents::{
    claim_for_processing, insert_document, list_documents_for_user, mark_extracted, mark_failed,
    require_document, Claim, Document, DocumentStatus, ExtractedFields, FailedFields, NewDocument,
};
use crate::error::{BackendError, ExtractError, NormalizeError, PipelineError, Result};
use crate::formatter::{build_extraction_prompt, format_for_backend, system_prompt};
use crate::import::{import_approved, ImportOutcome};
use crate::normalizer::{normalize_response, ExtractedTransaction, Extraction, StatementInfo};
use crate::pdf::{self, ExtractionSettings};
use crate::staging::{
    self, candidates_for_document, insert_candidate, BulkAction, BulkOutcome, CandidateTransaction,
    CandidateUpdate, ReviewSummary,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// DOCUMENT STORAGE
// ============================================================================

/// Directory holding uploaded statement binaries
#[derive(Debug, Clone)]
pub struct DocumentStorage {
    root: PathBuf,
}

impl DocumentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` as `filename`, creating the directory on first use
    pub async fn save(&self, filename: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    pub async fn remove(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub original_name: String,
    pub content_type: String,
    pub owner: String,
    pub bank_account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub filename: String,
    pub size: usize,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub document_id: String,
    pub provider: String,
    pub model: String,
    pub processing_time_ms: i64,
    pub transaction_count: usize,
    pub statement_info: StatementInfo,
    pub error: Option<String>,
}

/// Result of a stateless extraction (nothing persisted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub success: bool,
    pub provider: String,
    pub model: String,
    pub processing_time_ms: i64,
    pub transaction_count: usize,
    pub statement_info: StatementInfo,
    pub transactions: Vec<ExtractedTransaction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub transactions: Vec<CandidateTransaction>,
}

/// What gets stored in `extracted_data`
#[derive(Serialize)]
struct ExtractionRecord<'a> {
    provider: &'a str,
    model: &'a str,
    #[serde(flatten)]
    extraction: &'a Extraction,
}

// ============================================================================
// STAGE FAILURES
// ============================================================================

/// Anything that can go wrong between claim and persistence
#[derive(Error, Debug)]
enum StageError {
    #[error("Could not read stored document: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Could not save extraction: {0}")]
    Persist(PipelineError),

    #[error("Processing aborted: {0}")]
    Aborted(String),
}

struct StageFailure {
    error: StageError,
    /// Backend output, when the failure happened after the backend answered
    raw_response: Option<String>,
}

impl StageFailure {
    fn with_raw(error: impl Into<StageError>, raw: String) -> Self {
        Self {
            error: error.into(),
            raw_response: Some(raw),
        }
    }
}

impl From<std::io::Error> for StageFailure {
    fn from(e: std::io::Error) -> Self {
        Self { error: e.into(), raw_response: None }
    }
}

impl From<ExtractError> for StageFailure {
    fn from(e: ExtractError) -> Self {
        Self { error: e.into(), raw_response: None }
    }
}

impl From<BackendError> for StageFailure {
    fn from(e: BackendError) -> Self {
        Self { error: e.into(), raw_response: None }
    }
}

/// Reject uploads that are not PDFs, empty, or over the size limit
pub fn validate_upload(content_type: &str, size: usize) -> Result<()> {
    if !content_type.to_lowercase().contains("pdf") {
        return Err(PipelineError::UnsupportedFileType(content_type.to_string()));
    }
    if size == 0 {
        return Err(PipelineError::InvalidInput("Uploaded file is empty".to_string()));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(PipelineError::FileTooLarge(size));
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    storage: DocumentStorage,
    registry: BackendRegistry,
    settings: ExtractionSettings,
}

impl Pipeline {
    pub fn new(db: Database, storage: DocumentStorage, registry: BackendRegistry) -> Self {
        Self {
            db,
            storage,
            registry,
            settings: ExtractionSettings::default(),
        }
    }

    /// Open the configured database, upload directory and backends
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Database::open(&config.database.path)?,
            DocumentStorage::new(&config.storage.upload_dir),
            BackendRegistry::from_config(config)?,
        ))
    }

    pub fn with_settings(mut self, settings: ExtractionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Drop the pipeline and close the database; `false` if another clone is alive
    pub fn close(self) -> Result<bool> {
        self.db.close()
    }

    /// Store an uploaded statement and register it as PENDING
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt> {
        validate_upload(&request.content_type, request.bytes.len())?;
        if request.owner.trim().is_empty() {
            return Err(PipelineError::InvalidInput("user_id is required".to_string()));
        }

        let document_id = uuid::Uuid::new_v4().to_string();
        let filename = format!("{}.pdf", document_id);
        let path = self.storage.save(&filename, &request.bytes).await?;
        let checksum = format!("{:x}", Sha256::digest(&request.bytes));

        let new_doc = NewDocument {
            id: document_id.clone(),
            filename,
            original_name: request.original_name.clone(),
            file_size: request.bytes.len() as i64,
            mime_type: request.content_type.clone(),
            file_path: path.to_string_lossy().into_owned(),
            checksum,
            bank_account_id: request.bank_account_id.clone(),
            user_id: request.owner.clone(),
        };
        if let Err(e) = self.db.with_conn(|conn| insert_document(conn, &new_doc)) {
            // no row points at the binary, so it must not outlive the failed upload
            if let Err(cleanup) = self.storage.remove(&path).await {
                warn!(path = %path.display(), error = %cleanup, "Could not remove orphaned upload");
            }
            return Err(e);
        }

        info!(document_id = %document_id, size = request.bytes.len(), "Document uploaded");

        Ok(UploadReceipt {
            document_id,
            filename: request.original_name,
            size: request.bytes.len(),
            status: DocumentStatus::Pending,
        })
    }

    /// Run extraction for one uploaded document.
    ///
    /// Stage failures are recorded on the document and reported through
    /// `ProcessOutcome { success: false, .. }`; only request-level problems
    /// (missing document, unavailable backend, lost claim) are `Err`.
    pub async fn process(&self, document_id: &str, requested: Option<BackendKind>) -> Result<ProcessOutcome> {
        let start = Instant::now();
        let document = self.db.with_conn(|conn| require_document(conn, document_id))?;

        // resolved before the claim so a refused request leaves the document untouched
        let backend = self.registry.select(requested).await?;

        match self.db.with_conn(|conn| claim_for_processing(conn, document_id))? {
            Claim::Claimed { previous } => {
                info!(document_id, from = %previous, backend = backend.name(), "Processing document");
            }
            Claim::Rejected { current } => {
                return Err(PipelineError::InvalidState(format!(
                    "Document already processed (status: {})",
                    current
                )));
            }
            Claim::NotFound => return Err(PipelineError::NotFound("Document".to_string())),
        }

        // Owned task: dropping the caller (client disconnect, request timeout)
        // must not leave the document claimed with nobody to finish it.
        let task = {
            let pipeline = self.clone();
            let document_id = document_id.to_string();
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                pipeline
                    .finish_processing(&document_id, Path::new(&document.file_path), backend.as_ref(), start)
                    .await
            })
        };

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failure = StageFailure {
                    error: StageError::Aborted(e.to_string()),
                    raw_response: None,
                };
                self.persist_failure(document_id, backend.as_ref(), failure, start)
            }
        }
    }

    /// Everything after the claim: stages, then EXTRACTED or FAILED
    async fn finish_processing(
        &self,
        document_id: &str,
        path: &Path,
        backend: &dyn ExtractionBackend,
        start: Instant,
    ) -> Result<ProcessOutcome> {
        match self.run_stages(path, backend).await {
            Ok(extraction) => match self.persist_extraction(document_id, backend, &extraction, start) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    let failure = StageFailure {
                        error: StageError::Persist(e),
                        raw_response: Some(extraction.raw_response.clone()),
                    };
                    self.persist_failure(document_id, backend, failure, start)
                }
            },
            Err(failure) => self.persist_failure(document_id, backend, failure, start),
        }
    }

    async fn run_stages(
        &self,
        path: &Path,
        backend: &dyn ExtractionBackend,
    ) -> std::result::Result<Extraction, StageFailure> {
        let bytes = self.storage.read(path).await?;
        self.extract_bytes(&bytes, backend).await
    }

    async fn extract_bytes(
        &self,
        bytes: &[u8],
        backend: &dyn ExtractionBackend,
    ) -> std::result::Result<Extraction, StageFailure> {
        let content = pdf::extract_with(bytes, &self.settings)?;
        let document_text = format_for_backend(&content);
        let request = CompletionRequest::extraction(system_prompt(), build_extraction_prompt(&document_text));

        let raw = backend.complete(&request).await?;
        match normalize_response(&raw) {
            Ok(extraction) => Ok(extraction),
            Err(e) => Err(StageFailure::with_raw(e, raw)),
        }
    }

    fn persist_extraction(
        &self,
        document_id: &str,
        backend: &dyn ExtractionBackend,
        extraction: &Extraction,
        start: Instant,
    ) -> Result<ProcessOutcome> {
        let record = serde_json::to_value(ExtractionRecord {
            provider: backend.name(),
            model: backend.model(),
            extraction,
        })?;
        let processing_time_ms = elapsed_ms(start);

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for candidate in &extraction.transactions {
                insert_candidate(&tx, document_id, candidate)?;
            }
            mark_extracted(
                &tx,
                document_id,
                &ExtractedFields {
                    extracted_data: &record,
                    transaction_count: extraction.transactions.len() as i64,
                    llm_provider: backend.name(),
                    llm_model: backend.model(),
                    processing_time_ms,
                    statement_start_date: extraction.statement_info.statement_start.as_deref(),
                    statement_end_date: extraction.statement_info.statement_end.as_deref(),
                },
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!(
            document_id,
            transactions = extraction.transactions.len(),
            skipped = extraction.skipped,
            elapsed_ms = processing_time_ms,
            "Document extracted"
        );

        Ok(ProcessOutcome {
            success: true,
            document_id: document_id.to_string(),
            provider: backend.name().to_string(),
            model: backend.model().to_string(),
            processing_time_ms,
            transaction_count: extraction.transactions.len(),
            statement_info: extraction.statement_info.clone(),
            error: None,
        })
    }

    fn persist_failure(
        &self,
        document_id: &str,
        backend: &dyn ExtractionBackend,
        failure: StageFailure,
        start: Instant,
    ) -> Result<ProcessOutcome> {
        let message = failure.error.to_string();
        let processing_time_ms = elapsed_ms(start);
        let diagnostics = failure
            .raw_response
            .as_ref()
            .map(|raw| serde_json::json!({ "error": message, "raw_response": raw }));

        self.db.with_conn(|conn| {
            mark_failed(
                conn,
                document_id,
                &FailedFields {
                    error: &message,
                    llm_provider: Some(backend.name()),
                    llm_model: Some(backend.model()),
                    processing_time_ms,
                    extracted_data: diagnostics.as_ref(),
                },
            )
        })?;

        warn!(document_id, error = %message, "Document processing failed");

        Ok(ProcessOutcome {
            success: false,
            document_id: document_id.to_string(),
            provider: backend.name().to_string(),
            model: backend.model().to_string(),
            processing_time_ms,
            transaction_count: 0,
            statement_info: StatementInfo::default(),
            error: Some(message),
        })
    }

    /// Extract without persisting anything
    pub async fn extract_only(&self, bytes: &[u8], requested: Option<BackendKind>) -> Result<ExtractionReport> {
        let start = Instant::now();
        let backend = self.registry.select(requested).await?;

        let report = match self.extract_bytes(bytes, backend.as_ref()).await {
            Ok(extraction) => ExtractionReport {
                success: true,
                provider: backend.name().to_string(),
                model: backend.model().to_string(),
                processing_time_ms: elapsed_ms(start),
                transaction_count: extraction.transactions.len(),
                statement_info: extraction.statement_info,
                transactions: extraction.transactions,
                error: None,
            },
            Err(failure) => ExtractionReport {
                success: false,
                provider: backend.name().to_string(),
                model: backend.model().to_string(),
                processing_time_ms: elapsed_ms(start),
                transaction_count: 0,
                statement_info: StatementInfo::default(),
                transactions: Vec::new(),
                error: Some(failure.error.to_string()),
            },
        };

        Ok(report)
    }

    pub fn document_detail(&self, document_id: &str) -> Result<DocumentDetail> {
        self.db.with_conn(|conn| {
            Ok(DocumentDetail {
                document: require_document(conn, document_id)?,
                transactions: candidates_for_document(conn, document_id)?,
            })
        })
    }

    pub fn list_user_documents(&self, owner: &str) -> Result<Vec<Document>> {
        self.db.with_conn(|conn| list_documents_for_user(conn, owner))
    }

    // ------------------------------------------------------------------------
    // Review operations
    // ------------------------------------------------------------------------

    pub fn update_transaction(&self, id: &str, update: &CandidateUpdate) -> Result<()> {
        self.db.with_conn(|conn| staging::update_candidate(conn, id, update))
    }

    pub fn approve(&self, id: &str) -> Result<()> {
        self.db.with_conn(|conn| staging::approve(conn, id))
    }

    pub fn reject(&self, id: &str) -> Result<()> {
        self.db.with_conn(|conn| staging::reject(conn, id))
    }

    pub fn bulk(&self, ids: &[String], action: BulkAction) -> Result<BulkOutcome> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let outcome = staging::bulk(&tx, ids, action)?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    pub fn summary(&self, document_id: &str) -> Result<ReviewSummary> {
        self.db.with_conn(|conn| {
            require_document(conn, document_id)?;
            staging::summary(conn, document_id)
        })
    }

    pub fn check_duplicates(&self, document_id: &str, user_id: &str) -> Result<DuplicateReport> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let report = check_duplicates(&tx, document_id, user_id)?;
            tx.commit()?;
            Ok(report)
        })
    }

    pub fn import(&self, document_id: &str, budget_id: Option<&str>) -> Result<ImportOutcome> {
        self.db.with_conn(|conn| import_approved(conn, document_id, budget_id))
    }
}

// ============================================================================
// TESTS
// ============================================================================
