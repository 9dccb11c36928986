//! External collaborators: model provider, OCR provider and object store.
//!
//! Clients are built once at startup and handed to the orchestrator as trait
//! objects so tests can substitute fakes.

pub mod llm_client;
pub mod object_store;
pub mod ocr_client;

pub use llm_client::{strip_code_fences, LLMClient};
pub use object_store::{mime_type_for_path, HttpObjectStore, LocalObjectStore};
pub use ocr_client::OcrClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::document::BoundingBox;
use crate::message::Message;
use crate::session_store::UsageInfo;

/// One parsed unit of the provider's incremental output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Delta(String),
    UsageOnly(UsageInfo),
    Done,
    ProviderError(String),
}

pub type ProviderStream = BoxStream<'static, anyhow::Result<ProviderEvent>>;

#[derive(Debug, Clone, PartialEq)]
pub struct JsonCompletion {
    /// Model answer with any Markdown code fence removed.
    pub json_text: String,
    pub usage: Option<UsageInfo>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_chat(&self, messages: Vec<Message>) -> anyhow::Result<ProviderStream>;

    async fn complete_json(&self, messages: Vec<Message>) -> anyhow::Result<JsonCompletion>;
}

#[derive(Debug, Clone, Copy)]
pub struct OcrRequest<'a> {
    /// Staged on-disk copy of the upload.
    pub file: &'a Path,
    pub source_name: &'a str,
    pub mime_type: &'a str,
    pub include_images: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrImage {
    pub id: String,
    pub image_base64: Option<String>,
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub index: u32,
    pub markdown: String,
    pub images: Vec<OcrImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrUsage {
    pub pages_processed: u32,
    pub doc_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub pages: Vec<OcrPage>,
    pub usage: OcrUsage,
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn recognize(&self, request: OcrRequest<'_>) -> anyhow::Result<OcrOutput>;
}

/// Uploaded-file storage. Downloads are scoped to `owner_id`; `caller_token`
/// is forwarded so a remote store can apply its own access rules.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, owner_id: &str, path: &str, caller_token: &str) -> anyhow::Result<Vec<u8>>;

    fn mime_type(&self, path: &str) -> String {
        mime_type_for_path(path)
    }
}
