// doc-chat/crates/doc-chat/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. When documents are provided, \
answer using their content and say so when the documents do not contain the answer.";

pub const DEFAULT_ANALYSIS_PROMPT: &str = "You review documents. Respond with a JSON array only. \
Each element must be an object with the fields \"level\" (one of \"info\", \"warning\", \"error\"), \
\"description\" and \"location_hint\".";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub ocr_base_url: String,
    pub ocr_api_key: Option<String>,
    pub ocr_model: String,
    pub object_store_url: String,
    pub jwt_secret: String,
    pub system_prompt: String,
    pub analysis_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream_timeout_seconds: u64,
    pub ocr_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_concurrent_streams: usize,
    pub max_files_per_request: usize,
    pub temp_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = optional("JWT_SECRET")
            .context("JWT_SECRET environment variable not set. Please set it in your .env file")?;

        let llm_base_url = get("LLM_BASE_URL", "http://127.0.0.1:8081");
        let llm_api_key = optional("LLM_API_KEY");

        Ok(Self {
            api_host: get("API_HOST", "127.0.0.1"),
            api_port: get("API_PORT", "8000").parse().context("API_PORT must be a port number")?,
            database_path: PathBuf::from(get("DATABASE_PATH", "./data/doc-chat.db")),
            ocr_base_url: optional("OCR_BASE_URL").unwrap_or_else(|| llm_base_url.clone()),
            ocr_api_key: optional("OCR_API_KEY").or_else(|| llm_api_key.clone()),
            ocr_model: get("OCR_MODEL", "ocr-latest"),
            llm_base_url,
            llm_api_key,
            llm_model: get("LLM_MODEL", "default"),
            object_store_url: get("OBJECT_STORE_URL", "file://./data/uploads"),
            jwt_secret,
            system_prompt: optional("SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            analysis_prompt: optional("ANALYSIS_PROMPT").unwrap_or_else(|| DEFAULT_ANALYSIS_PROMPT.to_string()),
            max_tokens: get("MAX_TOKENS", "2000").parse().context("MAX_TOKENS must be an integer")?,
            temperature: get("TEMPERATURE", "0.7").parse().context("TEMPERATURE must be a number")?,
            stream_timeout_seconds: get("STREAM_TIMEOUT_SECONDS", "600")
                .parse()
                .context("STREAM_TIMEOUT_SECONDS must be an integer")?,
            ocr_timeout_seconds: get("OCR_TIMEOUT_SECONDS", "120")
                .parse()
                .context("OCR_TIMEOUT_SECONDS must be an integer")?,
            request_timeout_seconds: get("REQUEST_TIMEOUT_SECONDS", "300")
                .parse()
                .context("REQUEST_TIMEOUT_SECONDS must be an integer")?,
            max_concurrent_streams: get("MAX_CONCURRENT_STREAMS", "64")
                .parse()
                .context("MAX_CONCURRENT_STREAMS must be an integer")?,
            max_files_per_request: get("MAX_FILES_PER_REQUEST", "10")
                .parse()
                .context("MAX_FILES_PER_REQUEST must be an integer")?,
            temp_dir: optional("TEMP_DIR").map(PathBuf::from).unwrap_or_else(env::temp_dir),
        })
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_seconds)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Directory for `file://` object stores, `None` for HTTP stores.
    pub fn local_object_root(&self) -> Option<PathBuf> {
        self.object_store_url.strip_prefix("file://").map(PathBuf::from)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Database: {}", self.database_path.display());
        info!("- LLM Backend: {} (model: {})", self.llm_base_url, self.llm_model);
        info!("- OCR Backend: {} (model: {})", self.ocr_base_url, self.ocr_model);
        info!("- Object Store: {}", self.object_store_url);
        info!("- Max Tokens: {}, Temperature: {}", self.max_tokens, self.temperature);
        info!("- Stream Timeout: {}s", self.stream_timeout_seconds);
        info!("- OCR Timeout: {}s", self.ocr_timeout_seconds);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Max Streams: {}", self.max_concurrent_streams);
        info!("- Max Files Per Request: {}", self.max_files_per_request);
        info!("- Temp Dir: {}", self.temp_dir.display());
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}
