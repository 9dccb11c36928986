//! Uploaded-file storage backends.
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::ObjectStore;

/// MIME type guessed from the path's extension, `application/octet-stream`
/// when unknown.
pub fn mime_type_for_path(path: &str) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}

/// HTTP object store; objects live at `{base_url}/{path}`.
pub struct HttpObjectStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn download(&self, owner_id: &str, path: &str, caller_token: &str) -> anyhow::Result<Vec<u8>> {
        debug!("Downloading object {} for {}", path, owner_id);
        let response = self
            .http_client
            .get(self.object_url(path))
            .bearer_auth(caller_token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Object store request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Object store returned {} for {}", response.status(), path));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read object {}: {}", path, e))?;
        Ok(bytes.to_vec())
    }
}

/// Directory-backed store for single-host deployments. Each owner's uploads
/// live under `{root}/{owner_id}/` and paths are relative to that directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, owner_id: &str, path: &str) -> anyhow::Result<PathBuf> {
        let mut owner = Path::new(owner_id).components();
        let owner_dir = match (owner.next(), owner.next()) {
            (Some(Component::Normal(dir)), None) => dir,
            _ => return Err(anyhow::anyhow!("Invalid owner id for object store: {}", owner_id)),
        };

        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Invalid object path: {}", path));
        }
        Ok(self.root.join(owner_dir).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, owner_id: &str, path: &str, _caller_token: &str) -> anyhow::Result<Vec<u8>> {
        let full = self.resolve(owner_id, path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read object {}: {}", path, e))
    }
}
