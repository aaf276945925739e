use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::label::FaceLabel;

/// Face location as fractions of the image width/height
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Best indexed face for a searched crop
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    /// Raw label the face was indexed under
    pub label: String,
    /// Match score in percent
    pub similarity: f32,
    /// Detection confidence of the indexed face in percent
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// At least one face was indexed under the label
    Indexed { faces: usize },
    /// The service found no face to index
    NoFaceDetected,
}

/// External face indexing and search service
#[async_trait]
pub trait FaceDirectory: Send + Sync {
    /// Create the collection faces are indexed into; an existing one is fine
    async fn ensure_collection(&self) -> Result<(), ServiceError>;

    /// Index the face(s) in `image` under `label`
    async fn register(
        &self,
        label: &FaceLabel,
        image: &[u8],
    ) -> Result<RegisterOutcome, ServiceError>;

    /// Locate every face in `image`; an empty list is a valid answer
    async fn detect(&self, image: &[u8]) -> Result<Vec<BoundingBox>, ServiceError>;

    /// Search a single-face crop against the collection
    async fn search_crop(&self, image: &[u8]) -> Result<Option<FaceMatch>, ServiceError>;
}
