// ⚠️ Error taxonomy - one typed error per pipeline stage
//
// Stage errors (extraction, backend, normalization) never cross the
// orchestrator boundary: they end up in the document's `processing_error`.
// PipelineError is what operations return to callers (CLI, HTTP).

use thiserror::Error;

/// Content extraction failures (PDF → text/tables)
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Could not read PDF: {0}")]
    Unreadable(String),

    #[error("Could not extract text from PDF. The document may be scanned/image-based.")]
    NoExtractableText,

    #[error("Layout extraction failed: {0}")]
    Layout(String),

    #[error("Plain text extraction failed: {0}")]
    Plain(String),
}

/// Extraction backend failures (network, API, protocol)
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{backend} returned {status}: {body}")]
    Api {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("{0} API key not configured")]
    MissingApiKey(String),

    #[error("Unexpected response shape from {backend}: {reason}")]
    Protocol { backend: String, reason: String },
}

/// Backend output normalization failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("No structured data found in backend response")]
    NoStructuredData,

    #[error("Malformed structured data: {0}")]
    Malformed(String),
}

/// Operation-level error returned by the pipeline, staging and import APIs
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Only PDF files are supported (got {0})")]
    UnsupportedFileType(String),

    #[error("File too large. Maximum size is 10MB (got {0} bytes)")]
    FileTooLarge(usize),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Provider '{0}' is not available")]
    BackendUnavailable(String),

    #[error("Unknown provider '{0}'")]
    UnknownBackend(String),

    #[error("Document storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Errors caused by the caller (bad input, illegal transition, missing entity)
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            PipelineError::Storage(_) | PipelineError::Database(_) | PipelineError::Serialization(_)
        )
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::NotFound(_) => 404,
            e if e.is_client_error() => 400,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PipelineError::NotFound("Document".into()).status_code(), 404);
        assert_eq!(PipelineError::FileTooLarge(11).status_code(), 400);
        assert_eq!(PipelineError::UnsupportedFileType("text/plain".into()).status_code(), 400);
        assert_eq!(PipelineError::InvalidState("nope".into()).status_code(), 400);
        assert_eq!(PipelineError::BackendUnavailable("ollama".into()).status_code(), 400);
        assert_eq!(
            PipelineError::Database(rusqlite::Error::InvalidQuery).status_code(),
            500
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            NormalizeError::NoStructuredData.to_string(),
            "No structured data found in backend response"
        );
        assert_eq!(
            PipelineError::NotFound("Document".into()).to_string(),
            "Document not found"
        );
        assert!(ExtractError::NoExtractableText
            .to_string()
            .contains("scanned/image-based"));
        assert_eq!(
            ExtractError::Plain("page 2: bad stream".into()).to_string(),
            "Plain text extraction failed: page 2: bad stream"
        );
    }
}
