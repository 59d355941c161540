// 🌐 HTTP surface - axum router over the pipeline operations
//
// /api/documents/*     upload, process, extract, providers, detail, listing
// /api/transactions/*  review, duplicate check, import, summary
// /health, /health/ready

use crate::backends::{BackendDescription, BackendKind};
use crate::deduplication::DuplicateReport;
use crate::documents::Document;
use crate::error::PipelineError;
use crate::import::ImportOutcome;
use crate::pipeline::{
    validate_upload, DocumentDetail, ExtractionReport, Pipeline, ProcessOutcome, UploadReceipt, UploadRequest,
    MAX_UPLOAD_BYTES,
};
use crate::staging::{BulkAction, BulkOutcome, CandidateUpdate, ReviewSummary};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

/// API Response wrapper: `success` + payload fields + optional message
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: None,
        })
    }

    fn with_message(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: Some(message.into()),
        })
    }
}

#[derive(Serialize)]
struct Empty {}

fn ack(message: impl Into<String>) -> Json<ApiResponse<Empty>> {
    ApiResponse::with_message(Empty {}, message)
}

/// Error response: `{success: false, error}` with the mapped status
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({"success": false, "error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Empty or missing provider means "use the configured default"
fn parse_provider(raw: Option<&str>) -> Result<Option<BackendKind>, PipelineError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(name) => name.parse().map(Some),
    }
}

// ============================================================================
// Multipart
// ============================================================================

struct UploadedFile {
    bytes: Vec<u8>,
    file_name: String,
    content_type: String,
}

#[derive(Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    fields: BTreeMap<String, String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, PipelineError> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let file_name = field.file_name().unwrap_or("statement.pdf").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(invalid_multipart)?.to_vec();
                form.file = Some(UploadedFile {
                    bytes,
                    file_name,
                    content_type,
                });
            } else {
                let value = field.text().await.map_err(invalid_multipart)?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    fn take_file(&mut self) -> Result<UploadedFile, PipelineError> {
        self.file
            .take()
            .ok_or_else(|| PipelineError::InvalidInput("file is required".to_string()))
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str).filter(|v| !v.trim().is_empty())
    }
}

fn invalid_multipart(e: axum::extract::multipart::MultipartError) -> PipelineError {
    PipelineError::InvalidInput(format!("Invalid multipart body: {}", e))
}

// ============================================================================
// Document handlers
// ============================================================================

/// POST /api/documents/upload
async fn upload_document(State(state): State<AppState>, multipart: Multipart) -> ApiResult<UploadReceipt> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;
    let owner = form
        .field("user_id")
        .ok_or_else(|| PipelineError::InvalidInput("user_id is required".to_string()))?
        .to_string();

    let receipt = state
        .pipeline
        .upload(UploadRequest {
            bytes: file.bytes,
            original_name: file.file_name,
            content_type: file.content_type,
            owner,
            bank_account_id: form.field("bank_account_id").map(str::to_string),
        })
        .await?;

    Ok(ApiResponse::with_message(
        receipt,
        "Document uploaded. Call /process to extract transactions.",
    ))
}

#[derive(Debug, Deserialize)]
struct ProcessParams {
    llm_provider: Option<String>,
}

/// POST /api/documents/process/:document_id
async fn process_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Query(params): Query<ProcessParams>,
) -> Result<Json<ProcessOutcome>, ApiError> {
    let requested = parse_provider(params.llm_provider.as_deref())?;
    let outcome = state.pipeline.process(&document_id, requested).await?;
    Ok(Json(outcome))
}

/// POST /api/documents/extract - extraction without persistence
async fn extract_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ExtractionReport>, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;
    validate_upload(&file.content_type, file.bytes.len())?;

    let requested = parse_provider(form.field("llm_provider"))?;
    let report = state.pipeline.extract_only(&file.bytes, requested).await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct ProvidersResponse {
    providers: Vec<BackendDescription>,
    default: Option<BackendKind>,
}

/// GET /api/documents/providers
async fn list_providers(State(state): State<AppState>) -> ApiResult<ProvidersResponse> {
    let registry = state.pipeline.registry();
    Ok(ApiResponse::ok(ProvidersResponse {
        providers: registry.describe().await,
        default: registry.default_kind(),
    }))
}

/// GET /api/documents/document/:document_id
async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<DocumentDetail> {
    Ok(ApiResponse::ok(state.pipeline.document_detail(&document_id)?))
}

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<Document>,
}

/// GET /api/documents/user/:user_id/documents
async fn get_user_documents(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<DocumentList> {
    let documents = state.pipeline.list_user_documents(&user_id)?;
    Ok(ApiResponse::ok(DocumentList { documents }))
}

// ============================================================================
// Transaction handlers
// ============================================================================

/// PUT /api/transactions/:id
async fn update_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CandidateUpdate>,
) -> ApiResult<Empty> {
    state.pipeline.update_transaction(&id, &update)?;
    Ok(ack("Transaction updated"))
}

/// POST /api/transactions/:id/approve
async fn approve_transaction(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Empty> {
    state.pipeline.approve(&id)?;
    Ok(ack("Transaction approved"))
}

/// POST /api/transactions/:id/reject
async fn reject_transaction(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Empty> {
    state.pipeline.reject(&id)?;
    Ok(ack("Transaction rejected"))
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    transaction_ids: Vec<String>,
    action: BulkAction,
}

/// POST /api/transactions/bulk
async fn bulk_action(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<BulkOutcome> {
    let outcome = state.pipeline.bulk(&request.transaction_ids, request.action)?;
    let message = format!("{} of {} transactions: {}", outcome.affected, outcome.requested, outcome.action.as_str());
    Ok(ApiResponse::with_message(outcome, message))
}

#[derive(Debug, Deserialize)]
struct DuplicateCheckRequest {
    document_id: String,
    user_id: String,
}

/// POST /api/transactions/check-duplicates
async fn check_duplicates(
    State(state): State<AppState>,
    Json(request): Json<DuplicateCheckRequest>,
) -> ApiResult<DuplicateReport> {
    let report = state.pipeline.check_duplicates(&request.document_id, &request.user_id)?;
    Ok(ApiResponse::ok(report))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    document_id: String,
    budget_id: Option<String>,
}

/// POST /api/transactions/import
async fn import_transactions(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<ImportOutcome> {
    let outcome = state
        .pipeline
        .import(&request.document_id, request.budget_id.as_deref())?;
    let message = format!("Successfully imported {} transactions", outcome.imported_count);
    Ok(ApiResponse::with_message(outcome, message))
}

/// GET /api/transactions/summary/:document_id
async fn review_summary(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<ReviewSummary> {
    Ok(ApiResponse::ok(state.pipeline.summary(&document_id)?))
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "statement-ingest", "version": crate::VERSION}))
}

/// GET /health/ready - database reachable + backend availability
async fn readiness(State(state): State<AppState>) -> Response {
    let database = state
        .pipeline
        .database()
        .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?));

    let providers: BTreeMap<String, bool> = state
        .pipeline
        .registry()
        .describe()
        .await
        .into_iter()
        .map(|p| (p.id.code().to_string(), p.available))
        .collect();

    match database {
        Ok(_) => Json(json!({"status": "ready", "database": "ok", "providers": providers})).into_response(),
        Err(e) => {
            error!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "not_ready", "database": e.to_string(), "providers": providers})),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(pipeline: Pipeline) -> Router {
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let documents = Router::new()
        .route("/upload", post(upload_document))
        .route("/process/:document_id", post(process_document))
        .route("/extract", post(extract_document))
        .route("/providers", get(list_providers))
        .route("/document/:document_id", get(get_document))
        .route("/user/:user_id/documents", get(get_user_documents));

    let transactions = Router::new()
        .route("/bulk", post(bulk_action))
        .route("/check-duplicates", post(check_duplicates))
        .route("/import", post(import_transactions))
        .route("/summary/:document_id", get(review_summary))
        .route("/:id", put(update_transaction))
        .route("/:id/approve", post(approve_transaction))
        .route("/:id/reject", post(reject_transaction));

    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .nest("/api/documents", documents)
        .nest("/api/transactions", transactions)
        // headroom above the upload limit so oversize files get the descriptive 400
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES * 2))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::tests::stub;
    use crate::backends::{BackendRegistry, MockBackend};
    use crate::db::Database;
    use crate::pdf::tests::sample_statement;
    use crate::pipeline::DocumentStorage;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use chrono::NaiveDate;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "statement-ingest-test-boundary";

    fn app(uploads: &TempDir) -> Router {
        let anchor = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let registry = BackendRegistry::new(
            vec![
                stub(BackendKind::OpenAi, false, ""),
                Arc::new(MockBackend::with_anchor(anchor)),
            ],
            Some(BackendKind::Mock),
        );
        router(Pipeline::new(
            Database::open_in_memory().unwrap(),
            DocumentStorage::new(uploads.path()),
            registry,
        ))
    }

    fn multipart(file: Option<(&str, &str, &[u8])>, fields: &[(&str, &str)]) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content_type, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    BOUNDARY, file_name, content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Body::from(body)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn multipart_request(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(body)
            .unwrap()
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn upload(app: &Router) -> String {
        let pdf = sample_statement();
        let body = multipart(Some(("jan.pdf", "application/pdf", &pdf)), &[("user_id", "user-1")]);
        let (status, json) = send(app, multipart_request("/api/documents/upload", body)).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        json["document_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);

        let (status, json) = send(&app, empty_request(Method::GET, "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");

        let (status, json) = send(&app, empty_request(Method::GET, "/health/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["database"], "ok");
        assert_eq!(json["providers"]["mock"], true);
        assert_eq!(json["providers"]["openai"], false);
    }

    #[tokio::test]
    async fn test_upload_response() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);
        let pdf = sample_statement();

        let body = multipart(
            Some(("jan.pdf", "application/pdf", &pdf)),
            &[("user_id", "user-1"), ("bank_account_id", "acct-7")],
        );
        let (status, json) = send(&app, multipart_request("/api/documents/upload", body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["filename"], "jan.pdf");
        assert_eq!(json["size"], pdf.len());
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["message"], "Document uploaded. Call /process to extract transactions.");
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);

        let body = multipart(Some(("notes.txt", "text/plain", b"hello")), &[("user_id", "user-1")]);
        let (status, json) = send(&app, multipart_request("/api/documents/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().starts_with("Only PDF files are supported"));

        let body = multipart(None, &[("user_id", "user-1")]);
        let (status, json) = send(&app, multipart_request("/api/documents/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "file is required");

        let pdf = sample_statement();
        let body = multipart(Some(("jan.pdf", "application/pdf", &pdf)), &[]);
        let (status, _) = send(&app, multipart_request("/api/documents/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_process_review_import() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);
        let id = upload(&app).await;

        let (status, json) = send(&app, empty_request(Method::POST, &format!("/api/documents/process/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["provider"], "Mock");
        let count = json["transaction_count"].as_u64().unwrap();
        assert!((15..=25).contains(&count));

        let (_, detail) = send(&app, empty_request(Method::GET, &format!("/api/documents/document/{}", id))).await;
        assert_eq!(detail["document"]["status"], "EXTRACTED");
        let ids: Vec<String> = detail["transactions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len() as u64, count);

        let (status, json) = send(
            &app,
            json_request(
                Method::PUT,
                &format!("/api/transactions/{}", ids[0]),
                json!({"category": "Groceries", "notes": "weekly shop"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Transaction updated");

        let (status, _) = send(&app, empty_request(Method::POST, &format!("/api/transactions/{}/approve", ids[0]))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, json) = send(&app, empty_request(Method::POST, &format!("/api/transactions/{}/approve", ids[0]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Transaction not found or not in pending status");

        let (status, json) = send(
            &app,
            json_request(
                Method::POST,
                "/api/transactions/bulk",
                json!({"transaction_ids": [ids[1], ids[2]], "action": "approve"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["affected"], 2);

        let (_, json) = send(&app, empty_request(Method::POST, &format!("/api/transactions/{}/reject", ids[3]))).await;
        assert_eq!(json["success"], true);

        let (_, summary) = send(&app, empty_request(Method::GET, &format!("/api/transactions/summary/{}", id))).await;
        assert_eq!(summary["ready_to_import"], 3);

        let (status, json) = send(
            &app,
            json_request(Method::POST, "/api/transactions/import", json!({"document_id": id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["imported_count"], 3);
        assert_eq!(json["transaction_ids"].as_array().unwrap().len(), 3);
        assert_eq!(json["message"], "Successfully imported 3 transactions");

        let (_, list) = send(&app, empty_request(Method::GET, "/api/documents/user/user-1/documents")).await;
        assert_eq!(list["documents"][0]["status"], "IMPORTED");
    }

    #[tokio::test]
    async fn test_process_errors() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);
        let id = upload(&app).await;

        let (status, json) = send(
            &app,
            empty_request(Method::POST, &format!("/api/documents/process/{}?llm_provider=openai", id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Provider 'openai' is not available");

        let (status, _) = send(
            &app,
            empty_request(Method::POST, &format!("/api/documents/process/{}?llm_provider=claude", id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&app, empty_request(Method::POST, "/api/documents/process/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Document not found");

        // still processable after the refused requests
        let (_, json) = send(&app, empty_request(Method::GET, &format!("/api/documents/document/{}", id))).await;
        assert_eq!(json["document"]["status"], "PENDING");
    }

    #[tokio::test]
    async fn test_import_without_approvals() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);
        let id = upload(&app).await;
        send(&app, empty_request(Method::POST, &format!("/api/documents/process/{}", id))).await;

        let (status, json) = send(
            &app,
            json_request(Method::POST, "/api/transactions/import", json!({"document_id": id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "No approved transactions to import");
    }

    #[tokio::test]
    async fn test_extract_and_providers() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);
        let pdf = sample_statement();

        let body = multipart(Some(("jan.pdf", "application/pdf", &pdf)), &[("llm_provider", "mock")]);
        let (status, json) = send(&app, multipart_request("/api/documents/extract", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert!(json["transactions"].as_array().unwrap().len() >= 15);

        let (status, json) = send(&app, empty_request(Method::GET, "/api/documents/providers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["default"], "mock");
        assert_eq!(json["providers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_check_unknown_document() {
        let uploads = TempDir::new().unwrap();
        let app = app(&uploads);

        let (status, json) = send(
            &app,
            json_request(
                Method::POST,
                "/api/transactions/check-duplicates",
                json!({"document_id": "missing", "user_id": "user-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }
}
