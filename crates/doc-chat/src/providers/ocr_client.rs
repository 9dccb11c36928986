//! OCR provider client (`POST /v1/ocr`).
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{OcrImage, OcrOutput, OcrPage, OcrProvider, OcrRequest, OcrUsage};
use crate::config::Config;
use crate::document::BoundingBox;

#[derive(Debug, Serialize)]
struct OcrApiRequest<'a> {
    model: &'a str,
    document: OcrDocument,
    include_image_base64: bool,
}

#[derive(Debug, Serialize)]
struct OcrDocument {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Debug, Deserialize)]
struct OcrApiResponse {
    #[serde(default)]
    pages: Vec<OcrApiPage>,
    #[serde(default)]
    usage_info: Option<OcrApiUsage>,
}

#[derive(Debug, Deserialize)]
struct OcrApiPage {
    index: u32,
    #[serde(default)]
    markdown: String,
    #[serde(default)]
    images: Vec<OcrApiImage>,
}

#[derive(Debug, Deserialize)]
struct OcrApiImage {
    id: String,
    top_left_x: Option<f64>,
    top_left_y: Option<f64>,
    bottom_right_x: Option<f64>,
    bottom_right_y: Option<f64>,
    image_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcrApiUsage {
    #[serde(default)]
    pages_processed: u32,
    #[serde(default)]
    doc_size_bytes: Option<u64>,
}

impl OcrApiImage {
    fn bbox(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            top_left_x: self.top_left_x?,
            top_left_y: self.top_left_y?,
            bottom_right_x: self.bottom_right_x?,
            bottom_right_y: self.bottom_right_y?,
        })
    }
}

impl From<OcrApiResponse> for OcrOutput {
    fn from(response: OcrApiResponse) -> Self {
        let page_total = response.pages.len() as u32;
        let pages = response
            .pages
            .into_iter()
            .map(|page| OcrPage {
                index: page.index,
                markdown: page.markdown,
                images: page
                    .images
                    .into_iter()
                    .map(|image| OcrImage {
                        bbox: image.bbox(),
                        id: image.id,
                        image_base64: image.image_base64,
                    })
                    .collect(),
            })
            .collect();
        let usage = response
            .usage_info
            .map(|u| OcrUsage {
                pages_processed: u.pages_processed,
                doc_size_bytes: u.doc_size_bytes.unwrap_or(0),
            })
            .unwrap_or(OcrUsage { pages_processed: page_total, doc_size_bytes: 0 });
        OcrOutput { pages, usage }
    }
}

pub struct OcrClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl OcrClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("OCR client initialized with backend: {}", base_url);
        Self {
            base_url,
            api_key: None,
            model: model.into(),
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut client = Self::new(cfg.ocr_base_url.clone(), cfg.ocr_model.clone());
        client.api_key = cfg.ocr_api_key.clone();
        client
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn ocr_url(&self) -> String {
        format!("{}/v1/ocr", self.base_url)
    }
}

#[async_trait]
impl OcrProvider for OcrClient {
    async fn recognize(&self, request: OcrRequest<'_>) -> anyhow::Result<OcrOutput> {
        let bytes = tokio::fs::read(request.file)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read staged file {}: {}", request.file.display(), e))?;
        debug!("OCR request for '{}' ({} bytes, {})", request.source_name, bytes.len(), request.mime_type);

        let body = OcrApiRequest {
            model: &self.model,
            document: OcrDocument {
                kind: "document_url",
                document_url: format!("data:{};base64,{}", request.mime_type, BASE64.encode(&bytes)),
            },
            include_image_base64: request.include_images,
        };

        let mut builder = self.http_client.post(self.ocr_url()).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("OCR request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("OCR endpoint returned {}: {}", status, text));
        }

        let parsed: OcrApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse OCR response: {}", e))?;
        let mut output = OcrOutput::from(parsed);
        if output.usage.doc_size_bytes == 0 {
            output.usage.doc_size_bytes = bytes.len() as u64;
        }
        Ok(output)
    }
}
