//! Shared helpers for the HTTP integration tests: in-memory fakes of the face
//! directory, the document store and the text generator, plus a server
//! bound to an ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use face_attendance::chat::{Conversation, TextGenerator};
use face_attendance::error::ServiceError;
use face_attendance::face_directory::{BoundingBox, FaceDirectory, FaceMatch, RegisterOutcome};
use face_attendance::label::FaceLabel;
use face_attendance::preprocess::Pipeline;
use face_attendance::store::{
    now_timestamp, AttendanceFilter, AttendanceRecord, AttendanceStore, RecordFields, Subject,
};
use face_attendance::{router, AppState};

pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub fn unavailable(service: &'static str) -> ServiceError {
    ServiceError::Api {
        service,
        status: 503,
        code: Some("ServiceUnavailable".to_string()),
        message: "temporarily unavailable".to_string(),
    }
}

/// Scripted face directory
#[derive(Default)]
pub struct FakeFaceDirectory {
    /// Faces reported per IndexFaces call; 0 means no face detected
    pub faces_per_image: usize,
    pub register_fails: bool,
    /// Boxes returned for every detect call
    pub boxes: Vec<BoundingBox>,
    pub detect_fails: bool,
    /// Answers for successive searches; exhausted means no match
    pub searches: Mutex<VecDeque<Result<Option<FaceMatch>, ServiceError>>>,
    pub registered: Mutex<Vec<String>>,
    pub detect_calls: AtomicUsize,
}

impl FakeFaceDirectory {
    pub fn with_boxes(boxes: Vec<BoundingBox>) -> Self {
        Self {
            boxes,
            ..Default::default()
        }
    }

    pub fn push_search(&self, answer: Result<Option<FaceMatch>, ServiceError>) {
        self.searches.lock().unwrap().push_back(answer);
    }
}

pub fn face_box(left: f32, top: f32, width: f32, height: f32) -> BoundingBox {
    BoundingBox {
        left,
        top,
        width,
        height,
    }
}

pub fn matched(label: &str, confidence: f32) -> Result<Option<FaceMatch>, ServiceError> {
    Ok(Some(FaceMatch {
        label: label.to_string(),
        similarity: 98.0,
        confidence,
    }))
}

#[async_trait]
impl FaceDirectory for FakeFaceDirectory {
    async fn ensure_collection(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn register(
        &self,
        label: &FaceLabel,
        image: &[u8],
    ) -> Result<RegisterOutcome, ServiceError> {
        assert!(!image.is_empty());
        if self.register_fails {
            return Err(unavailable("rekognition"));
        }
        if self.faces_per_image == 0 {
            return Ok(RegisterOutcome::NoFaceDetected);
        }
        self.registered.lock().unwrap().push(label.encode());
        Ok(RegisterOutcome::Indexed {
            faces: self.faces_per_image,
        })
    }

    async fn detect(&self, image: &[u8]) -> Result<Vec<BoundingBox>, ServiceError> {
        assert!(!image.is_empty());
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        if self.detect_fails {
            return Err(unavailable("rekognition"));
        }
        Ok(self.boxes.clone())
    }

    async fn search_crop(&self, image: &[u8]) -> Result<Option<FaceMatch>, ServiceError> {
        assert!(!image.is_empty());
        self.searches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

/// In-memory store following the reference filter semantics
#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<Vec<AttendanceRecord>>,
    pub subjects: Mutex<Vec<Subject>>,
    next_id: AtomicUsize,
}

impl MemoryStore {
    fn new_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn seed(&self, records: Vec<AttendanceRecord>) {
        self.records.lock().unwrap().extend(records);
    }

    pub fn all(&self) -> Vec<AttendanceRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn query(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn insert(&self, fields: &RecordFields) -> Result<String, ServiceError> {
        let id = self.new_id("rec");
        self.records
            .lock()
            .unwrap()
            .push(fields.clone().into_record(id.clone()));
        Ok(id)
    }

    async fn upsert_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError> {
        let mut records = self.records.lock().unwrap();
        let merged = fields.clone().into_record(doc_id);
        match records.iter_mut().find(|r| r.doc_id == doc_id) {
            Some(existing) => *existing = merged,
            None => records.push(merged),
        }
        Ok(())
    }

    async fn update_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError> {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.doc_id == doc_id) {
            Some(existing) => {
                *existing = fields.clone().into_record(doc_id);
                Ok(())
            }
            None => Err(ServiceError::Api {
                service: "firestore",
                status: 404,
                code: Some("NOT_FOUND".to_string()),
                message: format!("No document to update: {}", doc_id),
            }),
        }
    }

    async fn add_subject(&self, name: &str) -> Result<Subject, ServiceError> {
        let subject = Subject {
            id: self.new_id("subj"),
            name: name.to_string(),
            created_at: now_timestamp(),
        };
        self.subjects.lock().unwrap().push(subject.clone());
        Ok(subject)
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>, ServiceError> {
        Ok(self.subjects.lock().unwrap().clone())
    }

    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, ServiceError> {
        Ok(self
            .subjects
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }
}

/// Generator answering `reply #<n>` and remembering every prompt
#[derive(Default)]
pub struct FakeGenerator {
    pub prompts: Mutex<Vec<String>>,
    pub fails: bool,
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, ServiceError> {
        let count = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len()
        };
        // Yield so concurrent chat requests get a chance to interleave
        tokio::task::yield_now().await;
        if self.fails {
            return Err(unavailable("gemini"));
        }
        Ok(Some(format!("reply #{}", count)))
    }
}

pub struct TestServer {
    pub url: String,
    pub state: Arc<AppState>,
    pub faces: Arc<FakeFaceDirectory>,
    pub store: Arc<MemoryStore>,
    pub generator: Arc<FakeGenerator>,
}

pub struct ServerOptions {
    pub faces: FakeFaceDirectory,
    pub store: MemoryStore,
    pub generator: FakeGenerator,
    pub conversation: Conversation,
    pub pipeline: Pipeline,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            faces: FakeFaceDirectory::default(),
            store: MemoryStore::default(),
            generator: FakeGenerator::default(),
            conversation: Conversation::default(),
            pipeline: Pipeline::Contrast,
        }
    }
}

/// Start the router on an ephemeral port
pub async fn start_server(options: ServerOptions) -> TestServer {
    let faces = Arc::new(options.faces);
    let store = Arc::new(options.store);
    let generator = Arc::new(options.generator);
    let state = Arc::new(AppState::new(
        faces.clone(),
        store.clone(),
        generator.clone(),
        options.conversation,
        options.pipeline,
    ));
    let app = router(state.clone(), MAX_BODY_BYTES);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    TestServer {
        url: format!("http://{}", addr),
        state,
        faces,
        store,
        generator,
    }
}

/// Small PNG encoded as a data URL
pub fn image_data_url(width: u32, height: u32) -> String {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 128])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&buf)
    )
}

pub fn record(doc_id: &str, student_id: &str, subject_id: &str, timestamp: &str) -> AttendanceRecord {
    AttendanceRecord {
        doc_id: doc_id.to_string(),
        student_id: student_id.to_string(),
        name: format!("Student {}", student_id),
        subject_id: subject_id.to_string(),
        subject_name: format!("Subject {}", subject_id),
        timestamp: timestamp.to_string(),
        status: "PRESENT".to_string(),
    }
}
