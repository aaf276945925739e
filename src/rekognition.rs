use async_trait::async_trait;
use base64::Engine;
use log::{debug, info};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::constants::{COLLECTION_ID, FACE_MATCH_THRESHOLD};
use crate::error::ServiceError;
use crate::face_directory::{BoundingBox, FaceDirectory, FaceMatch, RegisterOutcome};
use crate::label::FaceLabel;
use crate::retry::RetryPolicy;
use crate::sigv4::{self, AwsCredentials};

const SERVICE: &str = "rekognition";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const ALREADY_EXISTS: &str = "ResourceAlreadyExistsException";

/// AWS Rekognition over its JSON 1.1 HTTP protocol
pub struct RekognitionClient {
    http: Client,
    endpoint: Url,
    region: String,
    credentials: AwsCredentials,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IndexFacesResponse {
    #[serde(default)]
    face_records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DetectFacesResponse {
    #[serde(default)]
    face_details: Vec<FaceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FaceDetail {
    bounding_box: WireBox,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireBox {
    #[serde(default)]
    width: f32,
    #[serde(default)]
    height: f32,
    #[serde(default)]
    left: f32,
    #[serde(default)]
    top: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SearchFacesByImageResponse {
    #[serde(default)]
    face_matches: Vec<WireMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMatch {
    #[serde(default)]
    similarity: f32,
    face: WireFace,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireFace {
    #[serde(default)]
    external_image_id: String,
    #[serde(default)]
    confidence: f32,
}

/// Error body shape: `{"__type": "...#Code", "message"|"Message": "..."}`
fn parse_error(status: u16, body: &str) -> ServiceError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = parsed
        .get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .get("message")
        .or_else(|| parsed.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    ServiceError::Api {
        service: SERVICE,
        status,
        code,
        message,
    }
}

impl RekognitionClient {
    pub fn new(
        http: Client,
        region: &str,
        endpoint: Option<&str>,
        credentials: AwsCredentials,
        retry: RetryPolicy,
    ) -> Result<Self, url::ParseError> {
        let endpoint = match endpoint {
            Some(e) => Url::parse(e)?,
            None => Url::parse(&format!("https://rekognition.{}.amazonaws.com/", region))?,
        };
        Ok(Self {
            http,
            endpoint,
            region: region.to_string(),
            credentials,
            retry,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Sign and send one operation, decoding the JSON answer
    async fn call<T: DeserializeOwned>(&self, operation: &str, body: &Value) -> Result<T, ServiceError> {
        let payload = serde_json::to_vec(body).map_err(|e| ServiceError::Decode {
            service: SERVICE,
            message: e.to_string(),
        })?;
        let target = format!("RekognitionService.{}", operation);
        let signed = sigv4::sign_json_post(
            &self.credentials,
            &self.region,
            SERVICE,
            &self.host(),
            CONTENT_TYPE,
            &target,
            &payload,
            chrono::Utc::now(),
        );

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-target", &target)
            .header("authorization", &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        debug!("Rekognition {} ({} bytes)", operation, payload.len());
        let response = request.body(payload).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
            service: SERVICE,
            message: format!("{} response: {}", operation, e),
        })
    }
}

fn image_json(image: &[u8]) -> Value {
    json!({ "Bytes": base64::engine::general_purpose::STANDARD.encode(image) })
}

#[async_trait]
impl FaceDirectory for RekognitionClient {
    async fn ensure_collection(&self) -> Result<(), ServiceError> {
        let body = json!({ "CollectionId": COLLECTION_ID });
        match self.call::<Value>("CreateCollection", &body).await {
            Ok(_) => {
                info!("Collection '{}' created", COLLECTION_ID);
                Ok(())
            }
            Err(e) if e.code() == Some(ALREADY_EXISTS) => {
                info!("Collection '{}' already exists", COLLECTION_ID);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn register(
        &self,
        label: &FaceLabel,
        image: &[u8],
    ) -> Result<RegisterOutcome, ServiceError> {
        let body = json!({
            "CollectionId": COLLECTION_ID,
            "Image": image_json(image),
            "ExternalImageId": label.encode(),
            "DetectionAttributes": ["ALL"],
            "QualityFilter": "AUTO",
        });
        // Indexing twice would store a duplicate face, so this is never retried
        let response: IndexFacesResponse = self.call("IndexFaces", &body).await?;
        if response.face_records.is_empty() {
            Ok(RegisterOutcome::NoFaceDetected)
        } else {
            Ok(RegisterOutcome::Indexed {
                faces: response.face_records.len(),
            })
        }
    }

    async fn detect(&self, image: &[u8]) -> Result<Vec<BoundingBox>, ServiceError> {
        let body = json!({
            "Image": image_json(image),
            "Attributes": ["DEFAULT"],
        });
        let response: DetectFacesResponse = self
            .retry
            .run("DetectFaces", || self.call("DetectFaces", &body))
            .await?;
        Ok(response
            .face_details
            .into_iter()
            .map(|d| BoundingBox {
                left: d.bounding_box.left,
                top: d.bounding_box.top,
                width: d.bounding_box.width,
                height: d.bounding_box.height,
            })
            .collect())
    }

    async fn search_crop(&self, image: &[u8]) -> Result<Option<FaceMatch>, ServiceError> {
        let body = json!({
            "CollectionId": COLLECTION_ID,
            "Image": image_json(image),
            "MaxFaces": 1,
            "FaceMatchThreshold": FACE_MATCH_THRESHOLD,
        });
        let response: SearchFacesByImageResponse = self
            .retry
            .run("SearchFacesByImage", || self.call("SearchFacesByImage", &body))
            .await?;
        Ok(response.face_matches.into_iter().next().map(|m| FaceMatch {
            label: m.face.external_image_id,
            similarity: m.similarity,
            confidence: m.face.confidence,
        }))
    }
}
