use crate::error::{Error, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/mrn_extract.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ai: AiSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default = "default_page_warning_threshold")]
    pub page_warning_threshold: usize,
}

fn default_page_warning_threshold() -> usize {
    150
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ai: AiSection::default(),
            paths: PathsSection::default(),
            server: ServerSection::default(),
            page_warning_threshold: default_page_warning_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AiBackend {
    /// Google Gemini, PDF sent to the vision model.
    #[default]
    Gemini,
    /// Any OpenAI-compatible chat endpoint, fed with page text.
    OpenAi,
    /// No AI call at all; pattern extraction only.
    Heuristics,
}

impl AiBackend {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            AiBackend::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            AiBackend::OpenAi => "https://api.openai.com/v1",
            AiBackend::Heuristics => "",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            AiBackend::Gemini => "GOOGLE_API_KEY",
            AiBackend::OpenAi | AiBackend::Heuristics => "LLM_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiSection {
    pub backend: AiBackend,
    pub model: String,
    /// Name of the environment variable holding the key.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f64,
    pub timeout_secs: u64,
}

impl Default for AiSection {
    fn default() -> Self {
        AiSection {
            backend: AiBackend::default(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: None,
            base_url: None,
            temperature: 0.1,
            timeout_secs: 300,
        }
    }
}

impl AiSection {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.backend.default_base_url())
            .trim_end_matches('/')
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.backend.default_api_key_env())
    }

    /// The key is only ever read from the environment.
    pub fn api_key(&self) -> Option<String> {
        env::var(self.api_key_env()).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        PathsSection {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            db_path: PathBuf::from("logs/extractions.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub max_upload_mb: u64,
    pub output_dir: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_upload_mb: 50,
            output_dir: PathBuf::from("backend/outputs"),
        }
    }
}

impl ServerSection {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize).saturating_mul(1024 * 1024)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load the file if it exists, then apply environment overrides.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            info!(path = %path.display(), "Loading config");
            Self::load(path)?
        } else {
            info!(path = %path.display(), "No config file; using defaults");
            Self::default()
        };
        cfg.apply_env(|name| env::var(name).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(model) = var("AI_MODEL") {
            self.ai.model = model;
        }
        if let Some(dir) = var("PDF_INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("PDF_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.ai.backend, AiBackend::Gemini);
        assert_eq!(cfg.ai.model, "gemini-2.5-flash");
        assert_eq!(cfg.page_warning_threshold, 150);
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.ai.api_key_env(), "GOOGLE_API_KEY");
    }

    #[test]
    fn test_sections_parse() {
        let cfg: Config = toml::from_str(
            r#"
            page_warning_threshold = 80

            [ai]
            backend = "openai"
            model = "qwen3:8b"
            base_url = "http://localhost:11434/v1/"

            [paths]
            output_dir = "/tmp/out"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ai.backend, AiBackend::OpenAi);
        assert_eq!(cfg.ai.base_url(), "http://localhost:11434/v1");
        assert_eq!(cfg.ai.api_key_env(), "LLM_API_KEY");
        assert_eq!(cfg.paths.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(cfg.paths.input_dir, PathBuf::from("input"));
        assert_eq!(cfg.page_warning_threshold, 80);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(|name| match name {
            "AI_MODEL" => Some("gemini-1.5-pro".to_string()),
            "PDF_OUTPUT_DIR" => Some("elsewhere".to_string()),
            _ => None,
        });
        assert_eq!(cfg.ai.model, "gemini-1.5-pro");
        assert_eq!(cfg.paths.output_dir, PathBuf::from("elsewhere"));
        assert_eq!(cfg.paths.input_dir, PathBuf::from("input"));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.page_warning_threshold, 150);
    }
}
