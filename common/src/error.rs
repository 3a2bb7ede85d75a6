use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Invalid resource options found: {0:?}")]
    InvalidOptions(Vec<String>),
    #[error("Launch error: {0}")]
    Launch(String),
    #[error("Unknown resource status: {0}")]
    UnknownStatus(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("System call error: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Task processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
