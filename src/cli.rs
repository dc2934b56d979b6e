// src/cli.rs

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction_db::{ExtractionStore, SessionSummary};
use crate::pdf_pages;
use crate::processor::Processor;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// `*.pdf` files directly inside `dir`, any extension case, sorted by name.
pub fn pdf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "input directory {} does not exist",
            dir.display()
        )));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Process every PDF in `input_dir`; one failing file never stops the run.
pub async fn run_batch(
    cfg: &Config,
    processor: &Processor,
    store: &ExtractionStore,
    input_dir: &Path,
    output_dir: &Path,
) -> Result<SessionSummary> {
    let files = pdf_files(input_dir)?;
    let mut summary = SessionSummary {
        total_files: files.len(),
        ..SessionSummary::default()
    };
    if files.is_empty() {
        info!(dir = %input_dir.display(), "No PDF files to process");
        return Ok(summary);
    }

    fs::create_dir_all(output_dir)?;
    info!(files = files.len(), dir = %input_dir.display(), "Starting batch");
    let session_started = Instant::now();

    for pdf in &files {
        let started = Instant::now();
        match process_one(cfg, processor, store, pdf, output_dir).await {
            Ok(Some((tokens, cost_usd))) => {
                summary.successful += 1;
                summary.total_tokens += tokens;
                summary.total_cost_usd += cost_usd;
            }
            Ok(None) => summary.successful += 1,
            Err(failure) => {
                summary.failed += 1;
                warn!(file = %pdf.display(), error = %failure.error, "Skipping file");
                if let Some(id) = failure.log_id {
                    let logged = store.log_error(
                        &id,
                        failure.error.kind(),
                        &failure.error.to_string(),
                        Some(started.elapsed().as_secs_f64()),
                    );
                    if let Err(e) = logged {
                        warn!(id = %id, error = %e, "Could not log extraction failure");
                    }
                }
            }
        }
    }

    summary.total_processing_time_secs = session_started.elapsed().as_secs_f64();
    if let Err(e) = store.log_session_summary(&summary) {
        warn!(error = %e, "Could not log session summary");
    }
    print_summary(&summary, output_dir);
    Ok(summary)
}

struct FileFailure {
    log_id: Option<String>,
    error: Error,
}

impl From<Error> for FileFailure {
    fn from(error: Error) -> Self {
        FileFailure { log_id: None, error }
    }
}

/// Returns (tokens, cost in USD) when the AI was billed.
async fn process_one(
    cfg: &Config,
    processor: &Processor,
    store: &ExtractionStore,
    pdf: &Path,
    output_dir: &Path,
) -> std::result::Result<Option<(u64, f64)>, FileFailure> {
    let filename = display_name(pdf);
    let bytes = tokio::fs::read(pdf).await.map_err(Error::from)?;
    let id = store.log_start(&filename, &bytes)?;
    drop(bytes);

    let attempt = async {
        warn_if_long(pdf, cfg.page_warning_threshold)?;
        processor.process(pdf, output_dir).await
    };
    let result = attempt.await.map_err(|error| FileFailure {
        log_id: Some(id.clone()),
        error,
    })?;

    store.log_success(&id, &result)?;
    Ok(result
        .usage
        .as_ref()
        .map(|u| (u.total_tokens, u.total_cost_usd)))
}

fn warn_if_long(pdf: &Path, threshold: usize) -> Result<()> {
    let pages = pdf_pages::page_count(pdf)?;
    if pages > threshold {
        warn!(
            file = %pdf.display(),
            pages,
            threshold,
            "PDF exceeds the page limit; processing anyway"
        );
    }
    Ok(())
}

fn display_name(pdf: &Path) -> String {
    pdf.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| pdf.display().to_string())
}

fn print_summary(summary: &SessionSummary, output_dir: &Path) {
    println!("{}", "=".repeat(60));
    println!("Processed successfully: {} file(s)", summary.successful);
    if summary.failed > 0 {
        println!("Errors: {}", summary.failed);
    }
    println!(
        "Total cost: {:.2} CZK ({:.6} USD)",
        summary.total_cost_czk(),
        summary.total_cost_usd
    );
    println!("Total tokens: {}", summary.total_tokens);
    println!(
        "Total processing time: {:.2} s",
        summary.total_processing_time_secs
    );
    println!("Output folder: {}", output_dir.display());
    println!("{}", "=".repeat(60));
}

/// Process a single PDF and print the result as JSON.
pub async fn run_file(
    processor: &Processor,
    store: &ExtractionStore,
    pdf: &Path,
    output_dir: &Path,
) -> Result<()> {
    let bytes = tokio::fs::read(pdf).await?;
    let id = store.log_start(&display_name(pdf), &bytes)?;
    drop(bytes);

    let started = Instant::now();
    match processor.process(pdf, output_dir).await {
        Ok(result) => {
            store.log_success(&id, &result)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            store.log_error(
                &id,
                e.kind(),
                &e.to_string(),
                Some(started.elapsed().as_secs_f64()),
            )?;
            Err(e)
        }
    }
}

pub fn run_history(store: &ExtractionStore, limit: usize) -> Result<()> {
    let entries = store.history(limit)?;
    if entries.is_empty() {
        println!("No extractions logged yet.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {}  {:<8} {:<40} records={:<4} tokens={:<8} {}",
            entry.id,
            entry.started_at,
            entry.status,
            entry.pdf_filename,
            entry.records_count.map_or("-".to_string(), |n| n.to_string()),
            entry.total_tokens.map_or("-".to_string(), |n| n.to_string()),
            entry.error_message.as_deref().unwrap_or("")
        );
    }
    let (total, succeeded, failed) = store.get_counts()?;
    info!(total, succeeded, failed, "Extraction log totals");
    Ok(())
}

/// One logged extraction as pretty JSON.
pub fn show_extraction(store: &ExtractionStore, id: &str) -> Result<String> {
    let entry = store
        .get_extraction(id)?
        .ok_or_else(|| Error::InvalidInput(format!("no extraction with id {id}")))?;
    Ok(serde_json::to_string_pretty(&entry)?)
}

pub fn run_show(store: &ExtractionStore, id: &str) -> Result<()> {
    println!("{}", show_extraction(store, id)?);
    Ok(())
}
