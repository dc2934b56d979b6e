// src/llm_extract.rs

use crate::config::{AiBackend, AiSection};
use crate::error::{Error, Result};
use crate::pdf_pages;
use crate::usage::UsageInfo;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The prompt that instructs the model to extract shipment records.
pub const EXTRACTION_PROMPT: &str = r#"You are a freight-forwarding document extraction assistant.
The document is a bundle of Consignment Notes (CMR / consignment note pages), each followed by the
customs export declaration pages that carry its MRN (Movement Reference Number).

Return ONE JSON object per consignment note with exactly these keys:
{
  "consignment_note": "string (the consignment note number)",
  "gross_weight_kg": number or null,
  "packages": integer or null,
  "volume_m3": number or null,
  "hs_codes": ["8-digit HS tariff code", ...],
  "mrn": "string or null (the MRN code, 18 alphanumeric characters)",
  "mrn_pages": [1-based page numbers of the MRN pages belonging to this consignment note]
}

Notes:
- Keep repeated HS codes: each occurrence is a separate line item.
- Page numbers are 1-based in document order.
- Use null for fields you cannot determine.

Return ONLY a JSON array, starting with '[' and ending with ']'. No markdown fences, no commentary."#;

/// Longest page text sent in text mode.
const MAX_PROMPT_CHARS: usize = 400_000;

/// What the model said, untouched, plus what it cost.
#[derive(Debug, Clone, Default)]
pub struct AiReply {
    pub raw_text: Option<String>,
    pub usage: Option<UsageInfo>,
}

#[async_trait]
pub trait AiExtractor: Send + Sync {
    /// Short label for logs and the health endpoint.
    fn name(&self) -> &str;

    async fn extract(&self, pdf_path: &Path) -> Result<AiReply>;
}

pub type SharedExtractor = Arc<dyn AiExtractor>;

/// Resolved endpoint configuration ready to make API calls.
#[derive(Clone)]
struct ResolvedEndpoint {
    base_url: String,
    model: String,
    api_key: String,
    temperature: f64,
}

/// Build the configured extractor. `None` means the AI stage is skipped.
pub fn build_extractor(ai: &AiSection) -> Result<Option<SharedExtractor>> {
    let Some(endpoint) = resolve_endpoint(ai)? else {
        info!("Backend set to heuristics; AI extraction disabled");
        return Ok(None);
    };
    let client = Client::builder()
        .timeout(Duration::from_secs(ai.timeout_secs))
        .build()?;

    let extractor: SharedExtractor = match ai.backend {
        AiBackend::Gemini => Arc::new(GeminiExtractor { client, endpoint }),
        AiBackend::OpenAi => Arc::new(ChatExtractor { client, endpoint }),
        AiBackend::Heuristics => return Ok(None),
    };
    Ok(Some(extractor))
}

fn resolve_endpoint(ai: &AiSection) -> Result<Option<ResolvedEndpoint>> {
    if ai.backend == AiBackend::Heuristics {
        return Ok(None);
    }
    let api_key = ai.api_key().ok_or_else(|| {
        Error::Config(format!(
            "{} env var required for the {:?} backend",
            ai.api_key_env(),
            ai.backend
        ))
    })?;
    info!(
        backend = ?ai.backend,
        url = %ai.base_url(),
        model = %ai.model,
        "Using AI extraction backend"
    );
    Ok(Some(ResolvedEndpoint {
        base_url: ai.base_url().to_string(),
        model: ai.model.clone(),
        api_key,
        temperature: ai.temperature,
    }))
}

/// Page text with `--- PAGE n ---` markers, read off the async runtime.
async fn page_text(pdf_path: &Path) -> Result<String> {
    let path: PathBuf = pdf_path.to_path_buf();
    let text = tokio::task::spawn_blocking(move || -> Result<String> {
        let doc = pdf_pages::open(&path)?;
        Ok(pdf_pages::marked_text(&doc))
    })
    .await??;
    Ok(truncate_chars(text, MAX_PROMPT_CHARS))
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        warn!(max_chars, "Page text truncated for the prompt");
        text.truncate(cut);
    }
    text
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

/// Google Gemini `generateContent`, PDF inline; page text if that fails.
pub struct GeminiExtractor {
    client: Client,
    endpoint: ResolvedEndpoint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiExtractor {
    async fn generate(&self, parts: serde_json::Value) -> Result<AiReply> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint.base_url,
            urlencoding::encode(&self.endpoint.model)
        );
        let request = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "temperature": self.endpoint.temperature },
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.endpoint.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Ai(format!("Gemini API error {status}: {body}")));
        }

        let reply: GeminiResponse = response.json().await?;
        let text: String = reply
            .candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect();

        let usage = reply.usage_metadata.and_then(|u| {
            UsageInfo::from_tokens(
                &self.endpoint.model,
                u.prompt_token_count,
                u.candidates_token_count,
            )
        });
        if let Some(ref u) = usage {
            info!(
                tokens = u.total_tokens,
                cost_czk = %format!("{:.2}", u.total_cost_czk()),
                "Gemini token usage"
            );
        }

        Ok(AiReply {
            raw_text: Some(text.trim().to_string()).filter(|t| !t.is_empty()),
            usage,
        })
    }
}

#[async_trait]
impl AiExtractor for GeminiExtractor {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<AiReply> {
        let pdf_bytes = tokio::fs::read(pdf_path).await?;
        let instruction = "Extract all data from this PDF document following the instructions above. Return only a valid JSON array.";
        let prompt = format!("{EXTRACTION_PROMPT}\n\n{instruction}");

        let pdf_parts = json!([
            { "text": prompt },
            { "inlineData": { "mimeType": "application/pdf", "data": BASE64.encode(&pdf_bytes) } },
        ]);
        drop(pdf_bytes);

        match self.generate(pdf_parts).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(error = %e, "Gemini PDF request failed; retrying with page text");
                let text = page_text(pdf_path).await?;
                let parts = json!([{ "text": format!("{prompt}\n\nPDF content:\n{text}") }]);
                self.generate(parts).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

/// Any `/chat/completions` endpoint, fed with the page text.
pub struct ChatExtractor {
    client: Client,
    endpoint: ResolvedEndpoint,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl AiExtractor for ChatExtractor {
    fn name(&self) -> &str {
        "openai"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<AiReply> {
        let text = page_text(pdf_path).await?;

        let request = ChatRequest {
            model: self.endpoint.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: EXTRACTION_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Extract the shipment records from the following PDF text:\n\n{text}"),
                },
            ],
            temperature: self.endpoint.temperature,
        };

        let url = format!("{}/chat/completions", self.endpoint.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Ai(format!("LLM API error {status}: {body}")));
        }

        let chat_response: ChatResponse = response.json().await?;
        let usage = chat_response.usage.and_then(|u| {
            UsageInfo::from_tokens(&self.endpoint.model, u.prompt_tokens, u.completion_tokens)
        });
        let raw_text = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content);

        Ok(AiReply { raw_text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristics_backend_builds_nothing() {
        let ai = AiSection {
            backend: AiBackend::Heuristics,
            ..AiSection::default()
        };
        assert!(build_extractor(&ai).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let ai = AiSection {
            api_key_env: Some("MRN_EXTRACT_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..AiSection::default()
        };
        assert!(matches!(build_extractor(&ai), Err(Error::Config(_))));
    }

    #[test]
    fn test_truncate_chars_on_char_boundary() {
        assert_eq!(truncate_chars("žluťoučký".to_string(), 4), "žluť");
        assert_eq!(truncate_chars("short".to_string(), 10), "short");
    }

    #[tokio::test]
    async fn test_gemini_failure_does_not_leak_key() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = crate::pdf_pages::test_support::write_pdf(dir.path(), "a.pdf", &["CONSIGNMENT NOTE 1"]);
        let key = "SECRET-KEY-123";
        let extractor = GeminiExtractor {
            client: Client::builder().timeout(Duration::from_secs(5)).build().unwrap(),
            endpoint: ResolvedEndpoint {
                base_url: "http://127.0.0.1:9".to_string(),
                model: "gemini-2.5-flash".to_string(),
                api_key: key.to_string(),
                temperature: 0.1,
            },
        };

        let err = extractor.extract(&pdf).await.unwrap_err();

        assert!(matches!(err, Error::Http(_)));
        let message = format!("{err} {err:?}");
        assert!(!message.contains(key), "key leaked: {message}");
    }

    #[test]
    fn test_gemini_response_shape() {
        let body = r#"{
            "candidates": [{"content": {"parts": [{"text": "[{\"a\": 1}]"}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 80, "totalTokenCount": 1280}
        }"#;
        let reply: GeminiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(reply.candidates.len(), 1);
        let usage = reply.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 1200);
        assert_eq!(usage.candidates_token_count, 80);
    }
}
