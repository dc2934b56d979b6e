// src/error.rs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a document from being processed.
///
/// Per-page text failures and AI failures are recovered where they happen
/// and never surface here; what does surface is fatal for the document.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The PDF cannot be opened or its pages cannot be enumerated.
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Carries no request URL; see the `From` impl.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("AI extraction failed: {0}")]
    Ai(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // request URLs may carry credentials
        Error::Http(e.without_url())
    }
}

impl Error {
    /// Short category name stored in the extraction log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Pdf(_) => "pdf",
            Error::Csv(_) => "csv",
            Error::Json(_) => "json",
            Error::Http(_) => "http",
            Error::Database(_) => "database",
            Error::Ai(_) => "ai",
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "invalid_input",
            Error::Task(_) => "task",
        }
    }
}
