use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ServiceError;
use crate::oauth::TokenProvider;
use crate::retry::RetryPolicy;
use crate::store::{
    now_timestamp, AttendanceFilter, AttendanceRecord, AttendanceStore, RecordFields, Subject,
};

const SERVICE: &str = "firestore";
pub const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const LIST_PAGE_SIZE: &str = "300";

/// Collections the store reads and writes
#[derive(Debug, Clone)]
pub struct Collections {
    pub attendance: String,
    pub subjects: String,
}

/// Firestore document store over the REST API
pub struct FirestoreClient {
    http: Client,
    /// `{endpoint}/projects/{project}/databases/(default)/documents`
    documents_url: String,
    collections: Collections,
    tokens: TokenProvider,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Document {
    /// Last path segment of the resource name
    fn id(&self) -> String {
        let raw = self.name.rsplit('/').next().unwrap_or_default();
        urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string())
    }

    fn field(&self, key: &str) -> String {
        self.fields.get(key).map(value_to_string).unwrap_or_default()
    }

    fn into_record(self) -> AttendanceRecord {
        AttendanceRecord {
            doc_id: self.id(),
            student_id: self.field("student_id"),
            name: self.field("name"),
            subject_id: self.field("subject_id"),
            subject_name: self.field("subject_name"),
            timestamp: self.field("timestamp"),
            status: self.field("status"),
        }
    }

    fn into_subject(self) -> Subject {
        Subject {
            id: self.id(),
            name: self.field("name"),
            created_at: self.field("created_at"),
        }
    }
}

/// Render a typed Firestore value as the string the rest of the service uses
///
/// Null and missing values become the empty string.
pub fn value_to_string(value: &Value) -> String {
    let Some(obj) = value.as_object() else {
        return String::new();
    };
    let Some((kind, inner)) = obj.iter().next() else {
        return String::new();
    };
    match (kind.as_str(), inner) {
        ("nullValue", _) => String::new(),
        (_, Value::String(s)) => s.clone(),
        (_, Value::Bool(b)) => b.to_string(),
        (_, Value::Number(n)) => n.to_string(),
        (_, other) => other.to_string(),
    }
}

fn string_fields<'k, 'v>(pairs: impl IntoIterator<Item = (&'k str, &'v str)>) -> Value {
    let fields: Map<String, Value> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!({ "stringValue": v })))
        .collect();
    json!({ "fields": fields })
}

fn field_filter(path: &str, op: &str, value: &str) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": path },
            "op": op,
            "value": { "stringValue": value },
        }
    })
}

/// `runQuery` body for an attendance filter
pub fn structured_query(collection: &str, filter: &AttendanceFilter) -> Value {
    let mut conditions = Vec::new();
    if let Some(id) = &filter.student_id {
        conditions.push(field_filter("student_id", "EQUAL", id));
    }
    if let Some(id) = &filter.subject_id {
        conditions.push(field_filter("subject_id", "EQUAL", id));
    }
    if let Some(from) = &filter.from {
        conditions.push(field_filter("timestamp", "GREATER_THAN_OR_EQUAL", from));
    }
    if let Some(to) = &filter.to {
        conditions.push(field_filter("timestamp", "LESS_THAN_OR_EQUAL", to));
    }

    let mut query = json!({ "from": [{ "collectionId": collection }] });
    if conditions.len() == 1 {
        query["where"] = conditions.remove(0);
    } else if !conditions.is_empty() {
        query["where"] = json!({
            "compositeFilter": { "op": "AND", "filters": conditions }
        });
    }
    json!({ "structuredQuery": query })
}

/// Error body shape: `{"error": {"code": 404, "message": "...", "status": "NOT_FOUND"}}`
fn parse_error(status: u16, body: &str) -> ServiceError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = parsed.get("error");
    let code = error
        .and_then(|e| e.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = error
        .and_then(|e| e.get("message"))
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

impl FirestoreClient {
    pub fn new(
        http: Client,
        endpoint: Option<&str>,
        project_id: &str,
        collections: Collections,
        tokens: TokenProvider,
        retry: RetryPolicy,
    ) -> Self {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
        Self {
            http,
            documents_url: format!(
                "{}/projects/{}/databases/(default)/documents",
                endpoint,
                urlencoding::encode(project_id)
            ),
            collections,
            tokens,
            retry,
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.documents_url, urlencoding::encode(collection))
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(collection),
            urlencoding::encode(id)
        )
    }

    /// Authorize, send and decode one request
    async fn send<F>(&self, method: Method, url: &str, build: F) -> Result<Value, ServiceError>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        debug!("Firestore {} {}", method, url);
        let request = build(self.http.request(method, url).bearer_auth(token));
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
            service: SERVICE,
            message: e.to_string(),
        })
    }

    /// Create a document under a client-chosen id
    ///
    /// A conflict after a retried attempt means an earlier attempt landed.
    async fn create(&self, collection: &str, id: &str, body: &Value) -> Result<(), ServiceError> {
        let url = self.collection_url(collection);
        let url = &url;
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = self
            .retry
            .run("createDocument", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.send(Method::POST, url, |r| {
                    r.query(&[("documentId", id)]).json(body)
                })
                .await
                .map(|_| ())
            })
            .await;
        match result {
            Err(e) if e.status() == Some(409) && attempts.load(Ordering::SeqCst) > 1 => {
                debug!("Document {}/{} already created by an earlier attempt", collection, id);
                Ok(())
            }
            other => other,
        }
    }

    /// Merge `fields` into a document, optionally requiring it to exist
    async fn patch(
        &self,
        collection: &str,
        id: &str,
        fields: &RecordFields,
        must_exist: bool,
    ) -> Result<(), ServiceError> {
        let url = self.document_url(collection, id);
        let body = string_fields(fields.pairs());
        let mut params: Vec<(&str, &str)> = fields
            .pairs()
            .iter()
            .map(|(k, _)| ("updateMask.fieldPaths", *k))
            .collect();
        if must_exist {
            params.push(("currentDocument.exists", "true"));
        }
        let params = &params;
        let body = &body;
        let url = &url;
        self.retry
            .run("patchDocument", || async move {
                self.send(Method::PATCH, url, |r| r.query(params).json(body))
                    .await
                    .map(|_| ())
            })
            .await
    }

    async fn list_all(&self, collection: &str) -> Result<Vec<Document>, ServiceError> {
        let url = self.collection_url(collection);
        let url = &url;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.as_deref();
            let page = self
                .retry
                .run("listDocuments", || async move {
                    self.send(Method::GET, url, |r| {
                        let r = r.query(&[("pageSize", LIST_PAGE_SIZE)]);
                        match token {
                            Some(t) => r.query(&[("pageToken", t)]),
                            None => r,
                        }
                    })
                    .await
                })
                .await?;
            let page: ListDocumentsResponse =
                serde_json::from_value(page).map_err(|e| ServiceError::Decode {
                    service: SERVICE,
                    message: e.to_string(),
                })?;
            documents.extend(page.documents);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl AttendanceStore for FirestoreClient {
    async fn query(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, ServiceError> {
        let url = format!("{}:runQuery", self.documents_url);
        let url = &url;
        let body = structured_query(&self.collections.attendance, filter);
        let body = &body;
        let answer = self
            .retry
            .run("runQuery", || async move {
                self.send(Method::POST, url, |r| r.json(body)).await
            })
            .await?;
        let items: Vec<RunQueryItem> =
            serde_json::from_value(answer).map_err(|e| ServiceError::Decode {
                service: SERVICE,
                message: e.to_string(),
            })?;
        Ok(items
            .into_iter()
            .filter_map(|item| item.document)
            .map(Document::into_record)
            .collect())
    }

    async fn insert(&self, fields: &RecordFields) -> Result<String, ServiceError> {
        let id = uuid::Uuid::new_v4().to_string();
        let body = string_fields(fields.pairs());
        self.create(&self.collections.attendance, &id, &body).await?;
        Ok(id)
    }

    async fn upsert_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError> {
        self.patch(&self.collections.attendance, doc_id, fields, false)
            .await
    }

    async fn update_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError> {
        self.patch(&self.collections.attendance, doc_id, fields, true)
            .await
    }

    async fn add_subject(&self, name: &str) -> Result<Subject, ServiceError> {
        let subject = Subject {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now_timestamp(),
        };
        let body = string_fields([
            ("name", subject.name.as_str()),
            ("created_at", subject.created_at.as_str()),
        ]);
        self.create(&self.collections.subjects, &subject.id, &body)
            .await?;
        info!("Added subject '{}' ({})", subject.name, subject.id);
        Ok(subject)
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>, ServiceError> {
        Ok(self
            .list_all(&self.collections.subjects)
            .await?
            .into_iter()
            .map(Document::into_subject)
            .collect())
    }

    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, ServiceError> {
        let url = self.document_url(&self.collections.subjects, id);
        let url = &url;
        let result = self
            .retry
            .run("getDocument", || async move {
                self.send(Method::GET, url, |r| r).await
            })
            .await;
        match result {
            Ok(value) => {
                let doc: Document =
                    serde_json::from_value(value).map_err(|e| ServiceError::Decode {
                        service: SERVICE,
                        message: e.to_string(),
                    })?;
                Ok(Some(doc.into_subject()))
            }
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
