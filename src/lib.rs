// Statement Ingest - Core Library
// Bank statement PDF → extraction backend → staged review → ledger import

pub mod db;
pub mod error;
pub mod config;
pub mod logging;
pub mod pdf;            // Content extraction (text + tables)
pub mod formatter;      // Backend-ready document text + prompts
pub mod backends;       // Ollama / OpenAI / Mock
pub mod normalizer;     // Backend output → candidate transactions
pub mod documents;      // Document store + lifecycle guards
pub mod staging;        // Candidate store + review operations
pub mod ledger;         // Canonical transactions table
pub mod deduplication;  // Candidates vs. ledger
pub mod import;         // Approved candidates → ledger
pub mod pipeline;       // Orchestrator
#[cfg(feature = "server")]
pub mod api;            // HTTP surface

// Re-export commonly used types
pub use db::{Database, Event, setup_database, insert_event, get_events_for_entity};
pub use error::{BackendError, ExtractError, NormalizeError, PipelineError};
pub use config::Config;
pub use backends::{
    BackendKind, BackendRegistry, ExtractionBackend, CompletionRequest, ChatMessage,
    MockBackend, OllamaBackend, OpenAiBackend,
};
pub use normalizer::{ExtractedTransaction, Extraction, StatementInfo, TransactionType};
pub use documents::{Document, DocumentStatus};
pub use staging::{BulkAction, CandidateStatus, CandidateTransaction, CandidateUpdate, ReviewSummary};
pub use deduplication::{DuplicateReport, DuplicateFinding};
pub use import::ImportOutcome;
pub use pipeline::{DocumentStorage, Pipeline, ProcessOutcome, UploadReceipt, UploadRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
