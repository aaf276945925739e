//! # Subject and Attendance API Tests
//!
//! Covers subject management, attendance filtering, inline edits and the
//! spreadsheet export/import round trip.
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test --test attendance_api_test
//! ```

mod common;

use common::{record, start_server, ServerOptions, TestServer};
use face_attendance::constants::XLSX_MIME;
use face_attendance::spreadsheet;
use reqwest::multipart::{Form, Part};
use rust_xlsxwriter::Workbook;
use serde_json::{json, Value};

async fn seeded_server() -> TestServer {
    let server = start_server(ServerOptions::default()).await;
    server.store.seed(vec![
        record("a", "1", "math", "2023-12-31T23:59:59.999999"),
        record("b", "1", "math", "2024-01-01T00:00:00.000000"),
        record("c", "2", "math", "2024-01-01T12:30:00.000000"),
        record("d", "1", "art", "2024-01-01T23:59:59.999999"),
        record("e", "2", "art", "2024-01-02T00:00:00.000000"),
    ]);
    server
}

async fn get_attendance(server: &TestServer, query: &str) -> (u16, Value) {
    let response = reqwest::get(format!("{}/api/attendance{}", server.url, query))
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

fn doc_ids(body: &Value) -> Vec<String> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|r| r["doc_id"].as_str().unwrap().to_string())
        .collect()
}

async fn upload(server: &TestServer, filename: &str, bytes: Vec<u8>) -> (u16, Value) {
    let form = Form::new().part("file", Part::bytes(bytes).file_name(filename.to_string()));
    let response = reqwest::Client::new()
        .post(format!("{}/api/attendance/upload", server.url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_add_and_list_subjects() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/add_subject", server.url))
        .json(&json!({"subject_name": "  Mathematics "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Subject 'Mathematics' added successfully!");

    let body: Value = reqwest::get(format!("{}/get_subjects", server.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"subjects": [{"id": "subj-1", "name": "Mathematics"}]}));

    let stored = server.store.subjects.lock().unwrap().clone();
    assert!(!stored[0].created_at.is_empty());
}

#[tokio::test]
async fn test_add_subject_requires_name() {
    let server = start_server(ServerOptions::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/add_subject", server.url))
        .json(&json!({"subject_name": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No subject_name provided");
    assert!(server.store.subjects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_attendance_filters() {
    let server = seeded_server().await;

    let (status, body) = get_attendance(&server, "").await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 5);

    let (_, body) = get_attendance(&server, "?student_id=1&subject_id=math").await;
    assert_eq!(doc_ids(&body), vec!["a", "b"]);

    // Whole-day bounds are inclusive on both ends
    let (_, body) = get_attendance(&server, "?start_date=2024-01-01&end_date=2024-01-01").await;
    assert_eq!(doc_ids(&body), vec!["b", "c", "d"]);

    let (_, body) = get_attendance(&server, "?start_date=2024-01-02").await;
    assert_eq!(doc_ids(&body), vec!["e"]);

    let (_, body) = get_attendance(&server, "?student_id=&end_date=2023-12-31").await;
    assert_eq!(doc_ids(&body), vec!["a"]);
}

#[tokio::test]
async fn test_attendance_rejects_bad_dates() {
    let server = seeded_server().await;

    let (status, body) = get_attendance(&server, "?start_date=01/02/2024").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid start_date format. Use YYYY-MM-DD.");

    let (status, body) = get_attendance(&server, "?end_date=2024-13-01").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid end_date format. Use YYYY-MM-DD.");
}

#[tokio::test]
async fn test_update_skips_rows_without_doc_id() {
    let server = seeded_server().await;

    let mut edited = record("c", "2", "math", "2024-01-01T12:30:00.000000");
    edited.status = "ABSENT".to_string();
    edited.name = "Carol".to_string();
    let orphan = record("", "9", "math", "2024-01-03T08:00:00.000000");

    let response = reqwest::Client::new()
        .post(format!("{}/api/attendance/update", server.url))
        .json(&json!({"records": [edited, orphan]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Attendance records updated successfully.");

    let records = server.store.all();
    assert_eq!(records.len(), 5);
    let c = records.iter().find(|r| r.doc_id == "c").unwrap();
    assert_eq!(c.status, "ABSENT");
    assert_eq!(c.name, "Carol");
    assert!(records.iter().all(|r| r.student_id != "9"));
}

#[tokio::test]
async fn test_update_unknown_doc_id_is_500() {
    let server = seeded_server().await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/attendance/update", server.url))
        .json(&json!({"records": [record("missing", "1", "math", "2024-01-01T00:00:00.000000")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
}

#[tokio::test]
async fn test_download_exports_filtered_records() {
    let server = seeded_server().await;

    let response = reqwest::get(format!(
        "{}/api/attendance/download?subject_id=art",
        server.url
    ))
    .await
    .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        XLSX_MIME
    );
    assert_eq!(
        response.headers()["content-disposition"].to_str().unwrap(),
        "attachment; filename=\"attendance.xlsx\""
    );

    let bytes = response.bytes().await.unwrap();
    let rows = spreadsheet::parse_table(&bytes).unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["d", "e"]);
    assert_eq!(rows[0].fields.subject_name, "Subject art");
    assert_eq!(rows[1].fields.timestamp, "2024-01-02T00:00:00.000000");
}

#[tokio::test]
async fn test_template_download() {
    let server = start_server(ServerOptions::default()).await;

    let response = reqwest::get(format!("{}/api/attendance/template", server.url))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-disposition"].to_str().unwrap(),
        "attachment; filename=\"attendance_template.xlsx\""
    );
    let bytes = response.bytes().await.unwrap();
    assert!(spreadsheet::parse_table(&bytes).unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_round_trip_updates_and_inserts() {
    let server = seeded_server().await;

    let response = reqwest::get(format!("{}/api/attendance/download?student_id=2", server.url))
        .await
        .unwrap();
    let exported = response.bytes().await.unwrap();
    let mut rows = spreadsheet::parse_table(&exported).unwrap();
    assert_eq!(rows.len(), 2);

    // Re-export with one edit and one new row lacking a doc_id
    let mut edited: Vec<_> = rows
        .drain(..)
        .map(|row| row.fields.into_record(row.doc_id))
        .collect();
    edited[0].status = "LATE".to_string();
    edited.push(record("", "3", "math", "2024-02-01T09:00:00.000000"));
    let bytes = spreadsheet::export_to_table(&edited).unwrap();

    let (status, body) = upload(&server, "attendance.xlsx", bytes).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Excel data imported successfully.");
    assert_eq!(body["updated"], 2);
    assert_eq!(body["inserted"], 1);

    let records = server.store.all();
    assert_eq!(records.len(), 6);
    let c = records.iter().find(|r| r.doc_id == "c").unwrap();
    assert_eq!(c.status, "LATE");
    let inserted = records.iter().find(|r| r.student_id == "3").unwrap();
    assert_eq!(inserted.doc_id, "rec-1");
    assert_eq!(inserted.timestamp, "2024-02-01T09:00:00.000000");
}

#[tokio::test]
async fn test_upload_rejects_non_xlsx() {
    let server = seeded_server().await;

    let (status, body) = upload(&server, "attendance.csv", b"doc_id,student_id\n".to_vec()).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Please upload a .xlsx file");
    assert_eq!(server.store.all().len(), 5);
}

#[tokio::test]
async fn test_upload_rejects_wrong_header() {
    let server = seeded_server().await;

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (c, title) in ["student_id", "name", "status"].iter().enumerate() {
        sheet.write_string(0, c as u16, *title).unwrap();
    }
    sheet.write_string(1, 0, "1").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let (status, body) = upload(&server, "attendance.xlsx", bytes).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Incorrect template format");
    assert_eq!(server.store.all().len(), 5);
}

#[tokio::test]
async fn test_upload_without_multipart_body_is_json_error() {
    let server = start_server(ServerOptions::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/attendance/upload", server.url))
        .body("plain text")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_upload_requires_file_field() {
    let server = start_server(ServerOptions::default()).await;

    let form = Form::new().text("note", "no file here");
    let response = reqwest::Client::new()
        .post(format!("{}/api/attendance/upload", server.url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No file uploaded");
}
