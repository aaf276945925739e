use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::header,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::{de, Deserialize, Deserializer};
use serde_json::json;
use std::sync::Arc as StdArc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{Conversation, TextGenerator};
use crate::config::AppConfig;
use crate::constants::XLSX_MIME;
use crate::credentials::Secrets;
use crate::error::{ApiError, ServiceError};
use crate::face_directory::FaceDirectory;
use crate::firestore::{Collections, FirestoreClient};
use crate::gemini::GeminiClient;
use crate::oauth::{TokenProvider, DATASTORE_SCOPE};
use crate::preprocess::Pipeline;
use crate::recognition;
use crate::rekognition::RekognitionClient;
use crate::spreadsheet::{self, ImportError};
use crate::store::{
    AttendanceFilter, AttendanceQuery, AttendanceRecord, AttendanceStore, FilterError,
    RecordFields,
};

#[cfg(feature = "web-frontend")]
const INDEX_HTML: &str = include_str!("../static/index.html");

#[cfg(not(feature = "web-frontend"))]
const INDEX_HTML: &str =
    "<!DOCTYPE html><html><body><p>Built without the web frontend.</p></body></html>";

const REGISTER_HINT: &str =
    "Welcome to /register. Please POST with {name, student_id, image} to register.";
const RECOGNIZE_HINT: &str =
    "Welcome to /recognize. Please POST with {image, subject_id(optional)} to detect faces.";

// State for request handlers
pub struct AppState {
    pub faces: StdArc<dyn FaceDirectory>,
    pub store: StdArc<dyn AttendanceStore>,
    pub generator: StdArc<dyn TextGenerator>,
    /// Shared transcript; held for a whole chat turn so turns never interleave
    pub conversation: Mutex<Conversation>,
    /// Enhancement used by recognition
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(
        faces: StdArc<dyn FaceDirectory>,
        store: StdArc<dyn AttendanceStore>,
        generator: StdArc<dyn TextGenerator>,
        conversation: Conversation,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            faces,
            store,
            generator,
            conversation: Mutex::new(conversation),
            pipeline,
        }
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

/// Unwrap a JSON body, reporting malformed input as a 400
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

/// Accept a string or a number for free-form identifier fields
fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "invalid type: {}, expected a string or number",
            other
        ))),
    }
}

/// Log a service failure and turn it into a 500
fn service_failure(context: &str, err: ServiceError) -> ApiError {
    error!("{}: {}", context, err);
    ApiError::internal(format!("{}: {}", context, err))
}

/// Build the router with every route of the service
pub fn router(state: StdArc<AppState>, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/register", get(register_hint).post(register_handler))
        .route("/recognize", get(recognize_hint).post(recognize_handler))
        .route("/add_subject", post(add_subject_handler))
        .route("/get_subjects", get(get_subjects_handler))
        .route("/api/attendance", get(attendance_handler))
        .route("/api/attendance/update", post(update_attendance_handler))
        .route("/api/attendance/download", get(download_handler))
        .route("/api/attendance/template", get(template_handler))
        .route("/api/attendance/upload", post(upload_handler))
        .route("/process_prompt", post(process_prompt_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Build the external clients and serve until the process is stopped
pub fn run_server(config: AppConfig, secrets: Secrets) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.server.port;
    let retry = config.http.retry_policy();
    let http = reqwest::Client::builder()
        .timeout(config.http.timeout())
        .connect_timeout(config.http.connect_timeout())
        .build()?;

    let faces = RekognitionClient::new(
        http.clone(),
        &config.face_directory.region,
        config.face_directory.endpoint.as_deref(),
        secrets.aws.clone(),
        retry,
    )?;

    let project_id = config
        .store
        .project_id
        .clone()
        .unwrap_or_else(|| secrets.service_account.project_id.clone());
    let tokens = TokenProvider::new(
        http.clone(),
        secrets.service_account.clone(),
        DATASTORE_SCOPE,
        retry,
    );
    let store = FirestoreClient::new(
        http.clone(),
        config.store.endpoint.as_deref(),
        &project_id,
        Collections {
            attendance: config.store.attendance_collection.clone(),
            subjects: config.store.subjects_collection.clone(),
        },
        tokens,
        retry,
    );

    let generator = GeminiClient::new(
        http,
        config.chat.endpoint.as_deref(),
        &config.chat.model,
        &secrets.gemini_api_key,
    );

    println!("Face region: {}", config.face_directory.region);
    println!("Recognition pipeline: {:?}", config.face_directory.pipeline);
    println!("Firestore project: {}", project_id);
    println!("Chat model: {}", config.chat.model);
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", port);
    println!("Endpoints:");
    println!("  GET  /  - Attendance web page");
    println!("  POST /register  - Index a student's face");
    println!("  POST /recognize  - Identify faces and record attendance");
    println!("  POST /add_subject  - Create a subject");
    println!("  GET  /get_subjects  - List subjects");
    println!("  GET  /api/attendance?student_id&subject_id&start_date&end_date  - Query attendance");
    println!("  POST /api/attendance/update  - Save edited records");
    println!("  GET  /api/attendance/download  - Export attendance as .xlsx");
    println!("  GET  /api/attendance/template  - Blank import template");
    println!("  POST /api/attendance/upload  - Import an .xlsx file");
    println!("  POST /process_prompt  - Chat with the assistant");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = faces.ensure_collection().await {
            warn!("Could not ensure face collection exists: {}", e);
        }

        let app_state = StdArc::new(AppState::new(
            StdArc::new(faces),
            StdArc::new(store),
            StdArc::new(generator),
            Conversation::new(config.chat.max_memory, config.chat.pin_system_turn),
            config.face_directory.pipeline,
        ));
        let app = router(app_state, config.server.max_body_bytes);

        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", port, e))?;
        info!("Server started on port {}", port);
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn register_hint() -> &'static str {
    REGISTER_HINT
}

async fn recognize_hint() -> &'static str {
    RECOGNIZE_HINT
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(default, deserialize_with = "text_or_number")]
    name: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    student_id: Option<String>,
    image: Option<String>,
}

async fn register_handler(
    State(state): State<StdArc<AppState>>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = json_body(body).map_err(ApiError::as_message)?;
    let message = recognition::register(
        state.faces.as_ref(),
        body.name.as_deref(),
        body.student_id.as_deref(),
        body.image.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "message": message })))
}

#[derive(Debug, Deserialize)]
struct RecognizeBody {
    image: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    subject_id: Option<String>,
}

async fn recognize_handler(
    State(state): State<StdArc<AppState>>,
    body: Result<Json<RecognizeBody>, JsonRejection>,
) -> Result<Json<recognition::RecognitionReport>, ApiError> {
    let body = json_body(body).map_err(ApiError::as_message)?;
    let report = recognition::recognize(
        state.faces.as_ref(),
        state.store.as_ref(),
        state.pipeline,
        body.image.as_deref(),
        body.subject_id.as_deref(),
    )
    .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct AddSubjectBody {
    subject_name: Option<String>,
}

async fn add_subject_handler(
    State(state): State<StdArc<AppState>>,
    body: Result<Json<AddSubjectBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = json_body(body)?;
    let name = body.subject_name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::bad_request("No subject_name provided"));
    }
    let subject = state
        .store
        .add_subject(name)
        .await
        .map_err(|e| service_failure("Failed to add subject", e))?;
    Ok(Json(json!({
        "message": format!("Subject '{}' added successfully!", subject.name)
    })))
}

async fn get_subjects_handler(
    State(state): State<StdArc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subjects = state
        .store
        .list_subjects()
        .await
        .map_err(|e| service_failure("Failed to list subjects", e))?;
    let subjects: Vec<_> = subjects
        .into_iter()
        .map(|s| json!({ "id": s.id, "name": s.name }))
        .collect();
    Ok(Json(json!({ "subjects": subjects })))
}

async fn query_attendance(
    state: &AppState,
    params: &AttendanceQuery,
) -> Result<Vec<AttendanceRecord>, ApiError> {
    let filter = AttendanceFilter::from_query(params)?;
    state
        .store
        .query(&filter)
        .await
        .map_err(|e| service_failure("Failed to query attendance", e))
}

async fn attendance_handler(
    State(state): State<StdArc<AppState>>,
    Query(params): Query<AttendanceQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    Ok(Json(query_attendance(&state, &params).await?))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    records: Vec<AttendanceRecord>,
}

async fn update_attendance_handler(
    State(state): State<StdArc<AppState>>,
    body: Result<Json<UpdateBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = json_body(body)?;
    let mut updated = 0;
    for record in body.records.iter().filter(|r| !r.doc_id.trim().is_empty()) {
        state
            .store
            .update_by_id(record.doc_id.trim(), &RecordFields::from(record))
            .await
            .map_err(|e| service_failure("Failed to update attendance", e))?;
        updated += 1;
    }
    info!("Updated {} attendance record(s)", updated);
    Ok(Json(json!({ "message": "Attendance records updated successfully." })))
}

fn xlsx_attachment(filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, XLSX_MIME.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

async fn download_handler(
    State(state): State<StdArc<AppState>>,
    Query(params): Query<AttendanceQuery>,
) -> Result<Response, ApiError> {
    let records = query_attendance(&state, &params).await?;
    let bytes = spreadsheet::export_to_table(&records)
        .map_err(|e| ApiError::internal(format!("Failed to build spreadsheet: {}", e)))?;
    Ok(xlsx_attachment("attendance.xlsx", bytes))
}

async fn template_handler() -> Result<Response, ApiError> {
    let bytes = spreadsheet::template_table()
        .map_err(|e| ApiError::internal(format!("Failed to build spreadsheet: {}", e)))?;
    Ok(xlsx_attachment("attendance_template.xlsx", bytes))
}

async fn upload_handler(
    State(state): State<StdArc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut multipart =
        multipart.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if !filename.to_lowercase().ends_with(".xlsx") {
            return Err(ApiError::bad_request("Please upload a .xlsx file"));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?;
        upload = Some(bytes);
        break;
    }
    let bytes = upload.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;

    let rows = spreadsheet::parse_table(&bytes)?;
    let summary = spreadsheet::import_rows(state.store.as_ref(), rows)
        .await
        .map_err(|e| service_failure("Failed to import data", e))?;
    info!(
        "Imported spreadsheet: {} updated, {} inserted",
        summary.updated, summary.inserted
    );
    Ok(Json(json!({
        "message": "Excel data imported successfully.",
        "updated": summary.updated,
        "inserted": summary.inserted,
    })))
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    #[serde(default)]
    prompt: String,
}

async fn process_prompt_handler(
    State(state): State<StdArc<AppState>>,
    body: Result<Json<PromptBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = json_body(body)?;
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("No prompt provided"));
    }
    let mut conversation = state.conversation.lock().await;
    let reply = conversation.ask(state.generator.as_ref(), prompt).await;
    Ok(Json(json!({ "message": reply })))
}
