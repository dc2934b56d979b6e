// src/processor.rs

use crate::classify::classify;
use crate::error::{Error, Result};
use crate::heuristics;
use crate::llm_extract::SharedExtractor;
use crate::llm_response;
use crate::output;
use crate::reconcile::{self, Policy};
use crate::record::{ExtractionResult, OutputFiles, PageTypeMap, Record, RecordSource};
use crate::usage::UsageInfo;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{Instrument, info, info_span, warn};

/// Result of the AI stage.
enum AiOutcome {
    Records(Vec<Record>, Option<UsageInfo>),
    /// The model answered but nothing usable was in it.
    Empty { usage: Option<UsageInfo> },
    Failed(String),
    /// No extractor configured.
    Skipped,
}

/// Runs one PDF through extraction, classification, reconciliation and output.
///
/// Holds no per-document state; concurrent calls only need distinct
/// output directories.
#[derive(Clone)]
pub struct Processor {
    extractor: Option<SharedExtractor>,
}

struct Finished {
    records: Vec<Record>,
    page_types: PageTypeMap,
    page_count: usize,
    output_folder: PathBuf,
    output_files: OutputFiles,
    policy: Policy,
}

impl Processor {
    pub fn new(extractor: Option<SharedExtractor>) -> Self {
        Processor { extractor }
    }

    pub fn backend_name(&self) -> &str {
        self.extractor.as_ref().map_or("heuristics", |e| e.name())
    }

    /// Process `pdf_path`, writing into `{output_dir}/{stem}/`.
    pub async fn process(&self, pdf_path: &Path, output_dir: &Path) -> Result<ExtractionResult> {
        let stem = pdf_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("no file name in {}", pdf_path.display())))?
            .to_string();

        let span = info_span!("pdf", file = %stem);
        self.run(pdf_path, output_dir, stem).instrument(span).await
    }

    async fn run(&self, pdf_path: &Path, output_dir: &Path, stem: String) -> Result<ExtractionResult> {
        let started = Instant::now();
        info!(path = %pdf_path.display(), backend = self.backend_name(), "Processing PDF");

        let (records, record_source, usage) = match self.ai_stage(pdf_path).await {
            AiOutcome::Records(records, usage) => {
                info!(records = records.len(), "AI extraction succeeded");
                (records, RecordSource::Ai, usage)
            }
            AiOutcome::Empty { usage } => {
                warn!("AI reply held no records; using deterministic extraction");
                (fallback(pdf_path).await?, RecordSource::Deterministic, usage)
            }
            AiOutcome::Failed(reason) => {
                warn!(error = %reason, "AI extraction failed; using deterministic extraction");
                (fallback(pdf_path).await?, RecordSource::Deterministic, None)
            }
            AiOutcome::Skipped => (fallback(pdf_path).await?, RecordSource::Deterministic, None),
        };

        let pdf = pdf_path.to_path_buf();
        let folder = output_dir.join(&stem);
        let finished =
            tokio::task::spawn_blocking(move || finish(&pdf, folder, &stem, records)).await??;

        let processing_time_secs = started.elapsed().as_secs_f64();
        info!(
            records = finished.records.len(),
            without_mrn = finished.records.iter().filter(|r| r.mrn_pages.is_empty()).count(),
            source = record_source.as_str(),
            policy = ?finished.policy,
            mrn_pages = ?finished.page_types.mrn(),
            seconds = %format!("{processing_time_secs:.2}"),
            "PDF processed"
        );

        Ok(ExtractionResult {
            records: finished.records,
            record_source,
            page_types: finished.page_types,
            page_count: finished.page_count,
            output_folder: finished.output_folder,
            output_files: finished.output_files,
            usage,
            processing_time_secs,
        })
    }

    async fn ai_stage(&self, pdf_path: &Path) -> AiOutcome {
        let Some(extractor) = &self.extractor else {
            return AiOutcome::Skipped;
        };
        let reply = match extractor.extract(pdf_path).await {
            Ok(reply) => reply,
            Err(e) => return AiOutcome::Failed(e.to_string()),
        };

        let records = reply
            .raw_text
            .as_deref()
            .map(llm_response::parse)
            .unwrap_or_default();
        if records.is_empty() {
            AiOutcome::Empty { usage: reply.usage }
        } else {
            AiOutcome::Records(records, reply.usage)
        }
    }
}

async fn fallback(pdf_path: &Path) -> Result<Vec<Record>> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || heuristics::extract_without_ai(&path)).await?
}

fn finish(pdf: &Path, folder: PathBuf, stem: &str, mut records: Vec<Record>) -> Result<Finished> {
    let (mut page_types, page_count) = classify(pdf)?;
    let policy = reconcile::reconcile(&mut records, &mut page_types);

    fs::create_dir_all(&folder)?;
    let csv = folder.join(format!("{stem}.csv"));
    output::write_csv(&records, &csv)?;

    let mrn_pdf = if page_types.mrn().is_empty() {
        info!("No MRN pages; sub-PDF not written");
        None
    } else {
        let path = folder.join(format!("{stem}_MRN.pdf"));
        output::write_mrn_pdf(pdf, page_types.mrn(), &path)?;
        Some(path)
    };

    Ok(Finished {
        records,
        page_types,
        page_count,
        output_folder: folder,
        output_files: OutputFiles { csv, mrn_pdf },
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_extract::{AiExtractor, AiReply};
    use crate::pdf_pages::{self, test_support::write_pdf};
    use crate::record::MrnPages;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct CannedExtractor {
        raw_text: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl AiExtractor for CannedExtractor {
        fn name(&self) -> &str {
            "canned"
        }

        async fn extract(&self, _pdf_path: &Path) -> Result<AiReply> {
            if self.fail {
                return Err(Error::Ai("service unavailable".to_string()));
            }
            Ok(AiReply {
                raw_text: self.raw_text.clone(),
                usage: UsageInfo::from_tokens("gemini-2.5-flash", 1000, 200),
            })
        }
    }

    fn processor(raw_text: Option<&str>, fail: bool) -> Processor {
        Processor::new(Some(Arc::new(CannedExtractor {
            raw_text: raw_text.map(str::to_string),
            fail,
        })))
    }

    const FOUR_PAGES: [&str; 4] = [
        "CONSIGNMENT NOTE 40846302\nShipment total: 6colli 120,5 1,2",
        "Export declaration\nMRN 25CZ3O000OO1DAGMB8\nQBP3123 CZ 85472000",
        "Consignment note 40846399\nShipment total: 2colli 40 0,3",
        "Export declaration\nMRN 25CZ3O000OO1DAGMC9\nQBP3124 CZ 39269097",
    ];

    #[tokio::test]
    async fn test_ai_records_get_span_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "shipment.pdf", &FOUR_PAGES);
        let out = dir.path().join("out");
        let reply = r#"```json
[{"consignment_note": "40846302", "packages": 6, "mrn_pages": []},
 {"consignment_note": "40846399", "packages": 2, "mrn_pages": null}]
```"#;

        let result = processor(Some(reply), false).process(&pdf, &out).await.unwrap();

        assert_eq!(result.record_source, RecordSource::Ai);
        assert_eq!(result.page_count, 4);
        assert_eq!(result.records[0].mrn_pages, MrnPages::Scalar(2));
        assert_eq!(result.records[1].mrn_pages, MrnPages::Scalar(4));
        assert_eq!(result.page_types.consignment_notes(), &[1, 3]);
        assert_eq!(result.page_types.mrn(), &[2, 4]);
        assert!(result.usage.is_some());

        assert_eq!(result.output_folder, out.join("shipment"));
        assert_eq!(result.output_files.csv, out.join("shipment").join("shipment.csv"));
        let mrn_pdf = result.output_files.mrn_pdf.unwrap();
        assert_eq!(mrn_pdf, out.join("shipment").join("shipment_MRN.pdf"));
        assert_eq!(pdf_pages::page_count(&mrn_pdf).unwrap(), 2);

        let csv = fs::read_to_string(&result.output_files.csv).unwrap();
        assert_eq!(csv.lines().next(), Some("consignment_note,mrn_pages,packages"));
        assert!(csv.contains("40846302,2,6"));
    }

    #[tokio::test]
    async fn test_failed_ai_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "shipment.pdf", &FOUR_PAGES);

        let result = processor(None, true).process(&pdf, dir.path()).await.unwrap();

        assert_eq!(result.record_source, RecordSource::Deterministic);
        assert!(result.usage.is_none());
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].get("consignment_note"), Some(&json!("40846302")));
        assert_eq!(result.records[0].get("gross_weight_kg"), Some(&json!("120.5")));
        assert_eq!(result.records[1].get("hs_codes"), Some(&json!(["39269097"])));
        assert_eq!(result.records[0].mrn_pages.pages(), vec![2]);
        assert_eq!(result.page_types.mrn(), &[2, 4]);
    }

    #[tokio::test]
    async fn test_unusable_reply_falls_back_and_keeps_usage() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "shipment.pdf", &FOUR_PAGES);

        let result = processor(Some("I could not read the document."), false)
            .process(&pdf, dir.path())
            .await
            .unwrap();

        assert_eq!(result.record_source, RecordSource::Deterministic);
        assert_eq!(result.records.len(), 2);
        assert!(result.usage.is_some());
    }

    #[tokio::test]
    async fn test_nothing_found_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "blank.pdf", &["invoice", "terms"]);

        let result = Processor::new(None).process(&pdf, dir.path()).await.unwrap();

        assert!(result.records.is_empty());
        assert!(result.output_files.mrn_pdf.is_none());
        let csv = fs::read_to_string(&result.output_files.csv).unwrap();
        assert!(csv.contains(output::NO_DATA_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("broken.pdf");
        fs::write(&pdf, b"not a pdf at all").unwrap();

        assert!(Processor::new(None).process(&pdf, dir.path()).await.is_err());
    }
}
