use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::constants::STATUS_PRESENT;
use crate::error::{ApiError, ServiceError};
use crate::face_directory::{FaceDirectory, RegisterOutcome};
use crate::label::{is_valid_student_id, FaceLabel};
use crate::preprocess::{self, Pipeline, PreprocessError};
use crate::store::{now_timestamp, AttendanceStore, RecordFields};

pub const UNKNOWN_SUBJECT: &str = "Unknown Subject";

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("Missing name, student_id, or image")]
    MissingFields,
    #[error("Invalid student_id: only letters, digits, '_', '-', '.' and ':' are allowed")]
    InvalidStudentId,
    #[error("No image provided")]
    MissingImage,
    #[error("{0}")]
    Image(#[from] PreprocessError),
    #[error("No face detected in the image")]
    NoFaceDetected,
    #[error("Failed to index face: {0}")]
    Index(#[source] ServiceError),
    #[error("Failed to detect faces: {0}")]
    Detect(#[source] ServiceError),
    #[error("Failed to look up subject: {0}")]
    Subject(#[source] ServiceError),
}

impl RecognitionError {
    /// Caused by the request rather than a failing service
    pub fn is_client_error(&self) -> bool {
        match self {
            RecognitionError::MissingFields
            | RecognitionError::InvalidStudentId
            | RecognitionError::MissingImage
            | RecognitionError::NoFaceDetected => true,
            RecognitionError::Image(e) => !matches!(e, PreprocessError::Encode(_)),
            RecognitionError::Index(_)
            | RecognitionError::Detect(_)
            | RecognitionError::Subject(_) => false,
        }
    }
}

impl From<RecognitionError> for ApiError {
    fn from(err: RecognitionError) -> Self {
        let api = if err.is_client_error() {
            ApiError::bad_request(err.to_string())
        } else {
            error!("{}", err);
            ApiError::internal(err.to_string())
        };
        api.as_message()
    }
}

/// Match score reported per face, `"N/A"` when there is none
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    Score(f32),
    NotAvailable,
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Confidence::Score(v) => serializer.serialize_f32(*v),
            Confidence::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

/// Outcome for one detected face
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifiedPerson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IdentifiedPerson {
    fn failed(message: String) -> Self {
        Self {
            name: None,
            student_id: None,
            confidence: Confidence::NotAvailable,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReport {
    pub message: String,
    pub total_faces: usize,
    pub identified_people: Vec<IdentifiedPerson>,
}

fn required(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Index the face in a data-URL image under the student's label
pub async fn register(
    faces: &dyn FaceDirectory,
    name: Option<&str>,
    student_id: Option<&str>,
    image: Option<&str>,
) -> Result<String, RecognitionError> {
    let (Some(name), Some(student_id), Some(image)) =
        (required(name), required(student_id), required(image))
    else {
        return Err(RecognitionError::MissingFields);
    };
    if !is_valid_student_id(student_id) {
        return Err(RecognitionError::InvalidStudentId);
    }

    let bytes = preprocess::decode_data_url(image)?;
    // Registration always uses the contrast pass
    let prepared = Pipeline::Contrast.prepare(&bytes)?;
    let label = FaceLabel::new(name, student_id);

    match faces
        .register(&label, &prepared.jpeg)
        .await
        .map_err(RecognitionError::Index)?
    {
        RegisterOutcome::NoFaceDetected => Err(RecognitionError::NoFaceDetected),
        RegisterOutcome::Indexed { faces: count } => {
            info!("Indexed {} face(s) as '{}'", count, label);
            Ok(format!(
                "Student {} with ID {} registered successfully!",
                name, student_id
            ))
        }
    }
}

/// Name recorded on attendance for the selected subject
async fn lookup_subject_name(
    store: &dyn AttendanceStore,
    subject_id: &str,
) -> Result<String, RecognitionError> {
    if subject_id.is_empty() {
        return Ok(String::new());
    }
    let subject = store
        .get_subject(subject_id)
        .await
        .map_err(RecognitionError::Subject)?;
    Ok(subject
        .map(|s| s.name)
        .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string()))
}

/// Search one face crop and record attendance on a match
async fn identify(
    faces: &dyn FaceDirectory,
    store: &dyn AttendanceStore,
    crop: Option<image::RgbImage>,
    number: usize,
    subject_id: &str,
    subject_name: &str,
) -> IdentifiedPerson {
    let Some(crop) = crop else {
        return IdentifiedPerson::failed(format!(
            "Error searching face {}: face lies outside the image",
            number
        ));
    };
    let jpeg = match preprocess::encode_jpeg(&crop) {
        Ok(jpeg) => jpeg,
        Err(e) => return IdentifiedPerson::failed(format!("Error searching face {}: {}", number, e)),
    };

    let found = match faces.search_crop(&jpeg).await {
        Ok(found) => found,
        Err(e) => {
            warn!("Search for face {} failed: {}", number, e);
            return IdentifiedPerson::failed(format!("Error searching face {}: {}", number, e));
        }
    };
    let Some(found) = found else {
        return IdentifiedPerson::failed("Face not recognized".to_string());
    };

    debug!(
        "Face {} matched '{}' (similarity {:.1})",
        number, found.label, found.similarity
    );
    let label = FaceLabel::decode(&found.label);
    let mut person = IdentifiedPerson {
        name: Some(label.name.clone()),
        student_id: Some(label.student_id.clone()),
        confidence: Confidence::Score(found.confidence),
        message: None,
    };

    if label.is_known() {
        let fields = RecordFields {
            student_id: label.student_id,
            name: label.name,
            subject_id: subject_id.to_string(),
            subject_name: subject_name.to_string(),
            timestamp: now_timestamp(),
            status: STATUS_PRESENT.to_string(),
        };
        match store.insert(&fields).await {
            Ok(doc_id) => info!(
                "Recorded attendance {} for student {}",
                doc_id, fields.student_id
            ),
            Err(e) => {
                warn!("Failed to record attendance for face {}: {}", number, e);
                person.message = Some(format!("Failed to record attendance: {}", e));
            }
        }
    }
    person
}

/// Detect every face in a data-URL image, identify each one and log attendance
pub async fn recognize(
    faces: &dyn FaceDirectory,
    store: &dyn AttendanceStore,
    pipeline: Pipeline,
    image: Option<&str>,
    subject_id: Option<&str>,
) -> Result<RecognitionReport, RecognitionError> {
    let image = required(image).ok_or(RecognitionError::MissingImage)?;
    let subject_id = subject_id.unwrap_or_default().trim();
    let subject_name = lookup_subject_name(store, subject_id).await?;

    let bytes = preprocess::decode_data_url(image)?;
    let prepared = pipeline.prepare(&bytes)?;

    let mut identified_people = Vec::new();
    for region in pipeline.regions(prepared)? {
        let boxes = faces
            .detect(&region.jpeg)
            .await
            .map_err(RecognitionError::Detect)?;
        for bbox in boxes {
            let number = identified_people.len() + 1;
            let crop = preprocess::crop_normalized(
                &region.pixels,
                bbox.left,
                bbox.top,
                bbox.width,
                bbox.height,
            );
            identified_people
                .push(identify(faces, store, crop, number, subject_id, &subject_name).await);
        }
    }

    let total_faces = identified_people.len();
    let message = if total_faces == 0 {
        "No faces detected in the image.".to_string()
    } else {
        format!("{} face(s) detected in the photo.", total_faces)
    };
    info!("Recognition finished: {}", message);
    Ok(RecognitionReport {
        message,
        total_faces,
        identified_people,
    })
}
