//! OCR'd document context attached to a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top_left_x: f64,
    pub top_left_y: f64,
    pub bottom_right_x: f64,
    pub bottom_right_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    pub id: String,
    /// Base64 payload, possibly already carrying a `data:` prefix.
    pub data: Option<String>,
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub index: u32,
    pub text: String,
    #[serde(default)]
    pub images: Vec<PageImage>,
}

/// Normalized OCR output of one uploaded file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentContext {
    pub source_name: String,
    pub pages: Vec<Page>,
    pub page_count: u32,
    pub processed_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl DocumentContext {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
