// Library interface for testing

// Declare all modules
pub mod chat;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod face_directory;
pub mod firestore;
pub mod gemini;
pub mod label;
pub mod oauth;
pub mod preprocess;
pub mod recognition;
pub mod rekognition;
pub mod retry;
pub mod serve;
pub mod sigv4;
pub mod spreadsheet;
pub mod store;

// Re-export the shared state types used by the binary and the integration tests
pub use serve::{router, AppState};
