//! Turns one uploaded file into a `DocumentContext` via the OCR provider.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::document::{DocumentContext, Page, PageImage};
use crate::error::ChatError;
use crate::providers::{OcrOutput, OcrProvider, OcrRequest};

pub struct DocumentExtractor {
    ocr: Arc<dyn OcrProvider>,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl DocumentExtractor {
    pub fn new(ocr: Arc<dyn OcrProvider>, temp_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ocr,
            temp_dir: temp_dir.into(),
            timeout,
        }
    }

    /// Extract pages from `bytes`. The staged copy lives only as long as this
    /// future: it is removed on success, failure, timeout and cancellation.
    pub async fn extract(
        &self,
        bytes: Vec<u8>,
        source_name: &str,
        mime_type: &str,
        include_images: bool,
    ) -> Result<DocumentContext, ChatError> {
        let failed = |reason: String| ChatError::DocumentProcessingFailed {
            source_name: source_name.to_string(),
            reason,
        };

        let byte_len = bytes.len() as u64;
        let temp_dir = self.temp_dir.clone();
        let suffix = staging_suffix(source_name);
        let staged = tokio::task::spawn_blocking(move || stage(&temp_dir, &suffix, &bytes))
            .await
            .map_err(|e| failed(format!("staging task failed: {}", e)))?
            .map_err(|e| failed(format!("staging failed: {}", e)))?;
        debug!("Staged {} ({} bytes) at {}", source_name, byte_len, staged.path().display());

        let request = OcrRequest {
            file: staged.path(),
            source_name,
            mime_type,
            include_images,
        };

        let output = match tokio::time::timeout(self.timeout, self.ocr.recognize(request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => return Err(failed(format!("OCR timed out after {}s", self.timeout.as_secs()))),
        };

        let document = normalize(output, source_name, include_images, byte_len);
        info!(
            "Extracted {} page(s) from {}",
            document.page_count, document.source_name
        );
        Ok(document)
    }

}

fn staging_suffix(source_name: &str) -> String {
    Path::new(source_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Blocking; run on the blocking pool. The returned guard deletes the file on drop.
fn stage(temp_dir: &Path, suffix: &str, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("doc-chat-")
        .suffix(suffix)
        .tempfile_in(temp_dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn normalize(output: OcrOutput, source_name: &str, include_images: bool, byte_len: u64) -> DocumentContext {
    let pages: Vec<Page> = output
        .pages
        .into_iter()
        .map(|page| Page {
            index: page.index,
            text: page.markdown,
            images: if include_images {
                page.images
                    .into_iter()
                    .filter(|img| img.image_base64.is_some())
                    .map(|img| PageImage {
                        id: img.id,
                        data: img.image_base64,
                        bbox: img.bbox,
                    })
                    .collect()
            } else {
                Vec::new()
            },
        })
        .collect();

    let processed_bytes = if output.usage.doc_size_bytes > 0 {
        output.usage.doc_size_bytes
    } else {
        byte_len
    };

    DocumentContext {
        source_name: source_name.to_string(),
        page_count: pages.len() as u32,
        pages,
        processed_bytes,
        created_at: Utc::now(),
    }
}
