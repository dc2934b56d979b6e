use crate::error::Result;
use crate::record::ExtractionResult;
use crate::usage::USD_TO_CZK;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};

pub struct ExtractionStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredExtraction {
    pub id: String,
    pub pdf_filename: String,
    pub pdf_sha256: String,
    /// "started", "success" or "error"
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub processing_time_seconds: Option<f64>,
    pub records_count: Option<i64>,
    pub record_source: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub csv_path: Option<String>,
    pub mrn_pdf_path: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// Totals of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub total_processing_time_secs: f64,
}

impl SessionSummary {
    pub fn total_cost_czk(&self) -> f64 {
        self.total_cost_usd * USD_TO_CZK
    }
}

const EXTRACTION_COLUMNS: &str = "id, pdf_filename, pdf_sha256, status, started_at, finished_at,
     processing_time_seconds, records_count, record_source, model, prompt_tokens,
     completion_tokens, total_tokens, cost_usd, csv_path, mrn_pdf_path, error_type, error_message";

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl ExtractionStore {
    /// Open (or create) the extraction log at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS extractions (
                id TEXT PRIMARY KEY,
                pdf_filename TEXT NOT NULL,
                pdf_sha256 TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'started',
                started_at TEXT NOT NULL,
                finished_at TEXT,
                processing_time_seconds REAL,
                records_count INTEGER,
                record_source TEXT,
                model TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                cost_usd REAL,
                csv_path TEXT,
                mrn_pdf_path TEXT,
                error_type TEXT,
                error_message TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                finished_at TEXT NOT NULL,
                total_files INTEGER NOT NULL,
                successful INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                total_cost_usd REAL NOT NULL,
                total_processing_time_seconds REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_extractions_started_at ON extractions(started_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_extractions_status ON extractions(status)",
            [],
        )?;

        info!(path = %db_path.display(), "Extraction log initialized");
        Ok(Self { conn })
    }

    /// 16 hex chars of SHA-256 over file name, timestamp and content hash.
    pub fn generate_id(pdf_filename: &str, timestamp: &str, content_sha256: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pdf_filename.as_bytes());
        hasher.update(timestamp.as_bytes());
        hasher.update(content_sha256.as_bytes());
        let mut id = format!("{:x}", hasher.finalize());
        id.truncate(16);
        id
    }

    /// Record that processing of a PDF began; returns the new entry id.
    pub fn log_start(&self, pdf_filename: &str, pdf_bytes: &[u8]) -> Result<String> {
        let content_hash = sha256_hex(pdf_bytes);
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos().to_string();
        let id = Self::generate_id(pdf_filename, &stamp, &content_hash);
        self.insert_start(&id, pdf_filename, &content_hash)?;
        Ok(id)
    }

    /// Same as `log_start`, under an id chosen by the caller.
    pub fn log_start_with_id(&self, id: &str, pdf_filename: &str, pdf_bytes: &[u8]) -> Result<()> {
        self.insert_start(id, pdf_filename, &sha256_hex(pdf_bytes))
    }

    fn insert_start(&self, id: &str, pdf_filename: &str, content_hash: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO extractions (id, pdf_filename, pdf_sha256, status, started_at)
             VALUES (?1, ?2, ?3, 'started', ?4)",
            params![id, pdf_filename, content_hash, now_rfc3339()],
        )?;
        info!(id = id, file = pdf_filename, "Extraction started");
        Ok(())
    }

    pub fn log_success(&self, id: &str, result: &ExtractionResult) -> Result<()> {
        let usage = result.usage.as_ref();
        self.conn.execute(
            "UPDATE extractions SET
                status = 'success', finished_at = ?1, processing_time_seconds = ?2,
                records_count = ?3, record_source = ?4, model = ?5, prompt_tokens = ?6,
                completion_tokens = ?7, total_tokens = ?8, cost_usd = ?9,
                csv_path = ?10, mrn_pdf_path = ?11
             WHERE id = ?12",
            params![
                now_rfc3339(),
                result.processing_time_secs,
                result.records.len() as i64,
                result.record_source.as_str(),
                usage.map(|u| u.model.as_str()),
                usage.map(|u| u.prompt_tokens as i64),
                usage.map(|u| u.completion_tokens as i64),
                usage.map(|u| u.total_tokens as i64),
                usage.map(|u| u.total_cost_usd),
                result.output_files.csv.display().to_string(),
                result
                    .output_files
                    .mrn_pdf
                    .as_ref()
                    .map(|p| p.display().to_string()),
                id,
            ],
        )?;
        info!(
            id = id,
            records = result.records.len(),
            tokens = usage.map_or(0, |u| u.total_tokens),
            cost_czk = %format!("{:.2}", usage.map_or(0.0, |u| u.total_cost_czk())),
            "Extraction succeeded"
        );
        Ok(())
    }

    pub fn log_error(
        &self,
        id: &str,
        error_type: &str,
        error_message: &str,
        processing_time_secs: Option<f64>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE extractions SET
                status = 'error', finished_at = ?1, processing_time_seconds = ?2,
                error_type = ?3, error_message = ?4
             WHERE id = ?5",
            params![now_rfc3339(), processing_time_secs, error_type, error_message, id],
        )?;
        error!(id = id, error_type = error_type, error = error_message, "Extraction failed");
        Ok(())
    }

    pub fn log_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (finished_at, total_files, successful, failed, total_tokens,
                                   total_cost_usd, total_processing_time_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_rfc3339(),
                summary.total_files as i64,
                summary.successful as i64,
                summary.failed as i64,
                summary.total_tokens as i64,
                summary.total_cost_usd,
                summary.total_processing_time_secs,
            ],
        )?;
        info!(
            files = summary.total_files,
            successful = summary.successful,
            failed = summary.failed,
            tokens = summary.total_tokens,
            cost_czk = %format!("{:.2}", summary.total_cost_czk()),
            "Session summary"
        );
        Ok(())
    }

    /// Most recent entries first.
    pub fn history(&self, limit: usize) -> Result<Vec<StoredExtraction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_extraction)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_extraction(&self, id: &str) -> Result<Option<StoredExtraction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id], Self::row_to_extraction)
            .optional()?)
    }

    fn row_to_extraction(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredExtraction> {
        Ok(StoredExtraction {
            id: row.get(0)?,
            pdf_filename: row.get(1)?,
            pdf_sha256: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            processing_time_seconds: row.get(6)?,
            records_count: row.get(7)?,
            record_source: row.get(8)?,
            model: row.get(9)?,
            prompt_tokens: row.get(10)?,
            completion_tokens: row.get(11)?,
            total_tokens: row.get(12)?,
            cost_usd: row.get(13)?,
            csv_path: row.get(14)?,
            mrn_pdf_path: row.get(15)?,
            error_type: row.get(16)?,
            error_message: row.get(17)?,
        })
    }

    /// (total, succeeded, failed) extraction counts
    pub fn get_counts(&self) -> Result<(usize, usize, usize)> {
        let total: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM extractions", [], |row| row.get(0))?;

        let succeeded: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM extractions WHERE status = 'success'",
            [],
            |row| row.get(0),
        )?;

        let failed: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM extractions WHERE status = 'error'",
            [],
            |row| row.get(0),
        )?;

        Ok((total, succeeded, failed))
    }
}
