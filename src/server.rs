//! HTTP upload API.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction_db::ExtractionStore;
use crate::processor::Processor;
use crate::record::{ExtractionResult, PageTypeMap, Record, RecordSource};
use crate::usage::UsageInfo;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers
pub struct AppState {
    processor: Processor,
    store: Mutex<ExtractionStore>,
    output_dir: PathBuf,
    max_upload_bytes: usize,
    api_key_configured: bool,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(cfg: &Config, processor: Processor, store: ExtractionStore) -> Self {
        AppState {
            api_key_configured: cfg.ai.api_key().is_some(),
            processor,
            store: Mutex::new(store),
            output_dir: cfg.server.output_dir.clone(),
            max_upload_bytes: cfg.server.max_upload_bytes(),
        }
    }

    /// Extraction log writes never fail a request.
    fn log(&self, action: impl FnOnce(&ExtractionStore) -> Result<()>) {
        let store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = action(&store) {
            warn!(error = %e, "Could not write extraction log");
        }
    }
}

/// JSON `{ "error": ... }` with a status code.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match e {
            Error::InvalidInput(_) | Error::Pdf(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: format!("Processing failed: {e}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ai_backend: String,
    api_key_configured: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct UploadResponse {
    job_id: String,
    extraction_id: String,
    status: &'static str,
    filename: String,
    extracted_data: Vec<Record>,
    extracted_records_count: usize,
    record_source: RecordSource,
    page_types: PageTypeMap,
    page_count: usize,
    output_files: UploadOutputFiles,
    usage_info: Option<UsageInfo>,
    processing_time: f64,
}

#[derive(Serialize)]
struct UploadOutputFiles {
    csv: PathBuf,
    mrn_pdf: Option<PathBuf>,
    csv_download: String,
    mrn_pdf_download: Option<String>,
}

#[derive(Serialize)]
struct JobResults {
    job_id: String,
    csv_files: Vec<String>,
    pdf_files: Vec<String>,
    download_links: DownloadLinks,
}

#[derive(Serialize)]
struct DownloadLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    csv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mrn_pdf: Option<String>,
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/upload", post(upload_handler))
        .route(
            "/api/download/{file_type}/{job_id}/{filename}",
            get(download_handler),
        )
        .route("/api/results/{job_id}", get(results_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until Ctrl+C or SIGTERM.
pub async fn run_server(cfg: &Config, processor: Processor, store: ExtractionStore) -> Result<()> {
    let state = Arc::new(AppState::new(cfg, processor, store));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid address: {e}")))?;

    info!("Server listening on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /api/health                              - Health check");
    info!("  POST /api/upload                              - Upload and process a PDF");
    info!("  GET  /api/download/{{csv|pdf}}/{{job}}/{{file}}   - Download an output file");
    info!("  GET  /api/results/{{job}}                       - List the outputs of a job");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ai_backend: state.processor.backend_name().to_string(),
        api_key_configured: state.api_key_configured,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn upload_handler(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> std::result::Result<Json<UploadResponse>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid upload: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid upload: {e}")))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let (original_name, bytes) = upload.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    if original_name.is_empty() {
        return Err(ApiError::bad_request("No file selected"));
    }
    if !has_pdf_extension(&original_name) {
        return Err(ApiError::bad_request("File type not allowed. Allowed types: pdf"));
    }
    if bytes.len() > state.max_upload_bytes {
        return Err(ApiError::bad_request(format!(
            "File too large. Maximum size: {} MB",
            state.max_upload_bytes / (1024 * 1024)
        )));
    }
    let filename = secure_filename(&original_name);
    if filename.is_empty() {
        return Err(ApiError::bad_request("Invalid file name"));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let extraction_id = format!("web_{}_{}", unix, &job_id[..8]);
    info!(job_id = %job_id, file = %filename, bytes = bytes.len(), "Processing upload");

    let job_dir = state.output_dir.join(&job_id);
    tokio::fs::create_dir_all(&job_dir).await.map_err(Error::from)?;

    let tmp = tempfile::tempdir().map_err(Error::from)?;
    let pdf_path = tmp.path().join(&filename);
    tokio::fs::write(&pdf_path, &bytes).await.map_err(Error::from)?;
    state.log(|store| store.log_start_with_id(&extraction_id, &filename, &bytes));
    drop(bytes);

    let started = Instant::now();
    let mut result = match state.processor.process(&pdf_path, &job_dir).await {
        Ok(result) => result,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Upload processing failed");
            let elapsed = started.elapsed().as_secs_f64();
            state.log(|store| {
                store.log_error(&extraction_id, e.kind(), &e.to_string(), Some(elapsed))
            });
            return Err(e.into());
        }
    };
    flatten_outputs(&mut result, &job_dir)?;
    state.log(|store| store.log_success(&extraction_id, &result));

    let csv_download = download_link("csv", &job_id, &result.output_files.csv);
    let mrn_pdf_download = result
        .output_files
        .mrn_pdf
        .as_deref()
        .map(|p| download_link("pdf", &job_id, p));

    Ok(Json(UploadResponse {
        extraction_id,
        status: "success",
        filename,
        extracted_records_count: result.records.len(),
        extracted_data: result.records,
        record_source: result.record_source,
        page_types: result.page_types,
        page_count: result.page_count,
        output_files: UploadOutputFiles {
            csv: result.output_files.csv,
            mrn_pdf: result.output_files.mrn_pdf,
            csv_download,
            mrn_pdf_download,
        },
        usage_info: result.usage,
        processing_time: result.processing_time_secs,
        job_id,
    }))
}

async fn download_handler(
    State(state): State<SharedState>,
    UrlPath((file_type, job_id, filename)): UrlPath<(String, String, String)>,
) -> std::result::Result<Response, ApiError> {
    let content_type = match file_type.as_str() {
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        _ => return Err(ApiError::bad_request("Invalid file type")),
    };
    let job_id = secure_filename(&job_id);
    let filename = secure_filename(&filename);
    if job_id.is_empty() || filename.is_empty() {
        return Err(ApiError::not_found("File not found"));
    }

    let path = state.output_dir.join(&job_id).join(&filename);
    if !path.is_file() {
        return Err(ApiError::not_found("File not found"));
    }
    let bytes = tokio::fs::read(&path).await.map_err(Error::from)?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn results_handler(
    State(state): State<SharedState>,
    UrlPath(job_id): UrlPath<String>,
) -> std::result::Result<Json<JobResults>, ApiError> {
    let job_id = secure_filename(&job_id);
    let job_dir = state.output_dir.join(&job_id);
    if job_id.is_empty() || !job_dir.is_dir() {
        return Err(ApiError::not_found("Job not found"));
    }

    let mut csv_files = Vec::new();
    let mut pdf_files = Vec::new();
    let mut entries = tokio::fs::read_dir(&job_dir).await.map_err(Error::from)?;
    while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".csv") {
            csv_files.push(name);
        } else if name.ends_with("_MRN.pdf") {
            pdf_files.push(name);
        }
    }
    csv_files.sort();
    pdf_files.sort();

    let download_links = DownloadLinks {
        csv: csv_files
            .first()
            .map(|f| format!("/api/download/csv/{job_id}/{f}")),
        mrn_pdf: pdf_files
            .first()
            .map(|f| format!("/api/download/pdf/{job_id}/{f}")),
    };
    Ok(Json(JobResults {
        job_id,
        csv_files,
        pdf_files,
        download_links,
    }))
}

fn has_pdf_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("pdf"))
}

/// Reduce an uploaded file name to a safe single path component.
///
/// Keeps ASCII letters, digits, `.`, `_` and `-`; whitespace becomes `_`;
/// leading and trailing dots and underscores are dropped.
pub fn secure_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let joined = base.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn download_link(file_type: &str, job_id: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("/api/download/{file_type}/{job_id}/{name}")
}

/// Move the outputs from `{job_dir}/{stem}/` into `job_dir` itself.
fn flatten_outputs(result: &mut ExtractionResult, job_dir: &Path) -> Result<()> {
    let folder = result.output_folder.clone();
    if !folder.is_dir() || folder == job_dir {
        return Ok(());
    }

    for entry in std::fs::read_dir(&folder)? {
        let path = entry?.path();
        let Some(name) = path.file_name() else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let dest = job_dir.join(name);
        if dest.exists() {
            std::fs::remove_file(&dest)?;
        }
        std::fs::rename(&path, &dest)?;
    }
    if let Err(e) = std::fs::remove_dir(&folder) {
        warn!(folder = %folder.display(), error = %e, "Output subfolder not removed");
    }

    let move_up = |p: &Path| p.file_name().map(|n| job_dir.join(n));
    if let Some(csv) = move_up(result.output_files.csv.as_path()) {
        result.output_files.csv = csv;
    }
    result.output_files.mrn_pdf = result.output_files.mrn_pdf.as_deref().and_then(move_up);
    result.output_folder = job_dir.to_path_buf();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiBackend;
    use crate::pdf_pages::test_support::build_pdf;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "mrnextracttestboundary";

    struct TestApp {
        _dir: tempfile::TempDir,
        output_dir: PathBuf,
        state: SharedState,
    }

    fn app(max_upload_mb: u64) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.ai.backend = AiBackend::Heuristics;
        cfg.server.output_dir = dir.path().join("outputs");
        cfg.server.max_upload_mb = max_upload_mb;
        let store = ExtractionStore::new(dir.path().join("log.db")).unwrap();
        let state = Arc::new(AppState::new(&cfg, Processor::new(None), store));
        TestApp {
            output_dir: cfg.server.output_dir.clone(),
            _dir: dir,
            state,
        }
    }

    fn sample_pdf() -> Vec<u8> {
        let mut doc = build_pdf(&[
            "CONSIGNMENT NOTE 40846302\nShipment total: 6colli 120,5 1,2",
            "MRN 25CZ3O000OO1DAGMB8\nQBP3123 CZ 85472000",
        ]);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn upload_request(filename: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My Shipment 01.pdf"), "My_Shipment_01.pdf");
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("C:\\Users\\x\\doc.pdf"), "doc.pdf");
        assert_eq!(secure_filename("žluťoučký.pdf"), "luouk.pdf");
        assert_eq!(secure_filename(".."), "");
    }

    #[tokio::test]
    async fn test_health() {
        let test = app(50);
        let response = router(test.state.clone()).oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ai_backend"], "heuristics");
    }

    #[tokio::test]
    async fn test_upload_rejects_non_pdf() {
        let test = app(50);
        let response = router(test.state.clone())
            .oneshot(upload_request("notes.txt", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_file() {
        let test = app(0);
        let response = router(test.state.clone())
            .oneshot(upload_request("doc.pdf", &sample_pdf()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_then_download_and_results() {
        let test = app(50);
        let response = router(test.state.clone())
            .oneshot(upload_request("my shipment.pdf", &sample_pdf()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        assert_eq!(body["filename"], "my_shipment.pdf");
        assert_eq!(body["extracted_records_count"], 1);
        assert_eq!(body["extracted_data"][0]["consignment_note"], "40846302");
        assert_eq!(body["page_types"]["MRN"], serde_json::json!([2]));
        assert!(body["extraction_id"].as_str().unwrap().starts_with("web_"));

        let csv_link = body["output_files"]["csv_download"].as_str().unwrap();
        assert_eq!(csv_link, format!("/api/download/csv/{job_id}/my_shipment.csv"));
        assert!(test.output_dir.join(&job_id).join("my_shipment_MRN.pdf").is_file());
        assert!(!test.output_dir.join(&job_id).join("my_shipment").exists());

        let download = router(test.state.clone()).oneshot(get(csv_link)).await.unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        assert_eq!(download.headers()[header::CONTENT_TYPE], "text/csv");
        let csv = to_bytes(download.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&csv).contains("40846302"));

        let results = router(test.state.clone())
            .oneshot(get(&format!("/api/results/{job_id}")))
            .await
            .unwrap();
        assert_eq!(results.status(), StatusCode::OK);
        let results = json_body(results).await;
        assert_eq!(results["csv_files"], serde_json::json!(["my_shipment.csv"]));
        assert_eq!(results["pdf_files"], serde_json::json!(["my_shipment_MRN.pdf"]));
    }

    #[tokio::test]
    async fn test_download_errors() {
        let test = app(50);
        let bad_type = router(test.state.clone())
            .oneshot(get("/api/download/exe/job/file.exe"))
            .await
            .unwrap();
        assert_eq!(bad_type.status(), StatusCode::BAD_REQUEST);

        let missing = router(test.state.clone())
            .oneshot(get("/api/download/csv/job/file.csv"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unknown_job = router(test.state.clone())
            .oneshot(get("/api/results/unknown"))
            .await
            .unwrap();
        assert_eq!(unknown_job.status(), StatusCode::NOT_FOUND);
    }
}
