//! Content-addressed logo cache.
//!
//! Files live at `logos/<xx>/<hash>.<ext>` under the sandbox root with a
//! `.meta` sidecar recording the original URL. Storage is write-once per
//! content hash; concurrent fetches for the same URL collapse into one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sandbox_fs::SandboxRoot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::utils::UpstreamHttpClient;

pub const LOGO_DIR: &str = "logos";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoMeta {
    pub original_url: String,
    pub etag: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
}

pub struct LogoCacheService {
    sandbox: SandboxRoot,
    http: UpstreamHttpClient,
    fetch_permits: Semaphore,
    /// url -> cached relative path, plus per-URL fetch collapsing.
    index: Mutex<HashMap<String, String>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LogoCacheService {
    pub fn new(sandbox: SandboxRoot, http: UpstreamHttpClient, max_concurrent: usize) -> Self {
        Self {
            sandbox,
            http,
            fetch_permits: Semaphore::new(max_concurrent.max(1)),
            index: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch-and-store a logo URL, returning the sandbox-relative path of
    /// the cached file. A second call for the same URL reuses the first
    /// result, including while the first fetch is still in flight.
    pub async fn cache_logo(&self, url: &str, cancel: &CancellationToken) -> AppResult<String> {
        if let Some(path) = self.index.lock().await.get(url) {
            return Ok(path.clone());
        }

        let url_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _url_guard = url_lock.lock().await;

        // A collapsed waiter may find the result already indexed.
        if let Some(path) = self.index.lock().await.get(url) {
            return Ok(path.clone());
        }

        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| AppError::internal("logo fetch semaphore closed"))?;

        let body = self.http.get_bytes(url, cancel).await?;
        let hash = hex::encode(Sha256::digest(&body.bytes));
        let ext = extension_for(body.content_type.as_deref());
        let shard = &hash[..2];
        let relative = format!("{LOGO_DIR}/{shard}/{hash}.{ext}");

        // Write-once per content hash.
        if !self.sandbox.exists(&relative).await? {
            self.sandbox.write(&relative, &body.bytes).await?;
            let meta = LogoMeta {
                original_url: url.to_string(),
                etag: body.etag.clone(),
                fetched_at: Utc::now(),
                content_hash: hash.clone(),
            };
            let meta_json = serde_json::to_vec(&meta)
                .map_err(|e| AppError::internal(format!("logo meta serialization: {e}")))?;
            self.sandbox
                .write(&format!("{relative}.meta"), meta_json)
                .await?;
            debug!(url, path = %relative, "cached logo");
        }

        self.index
            .lock()
            .await
            .insert(url.to_string(), relative.clone());
        Ok(relative)
    }

    /// Evict cached logos whose original URL is no longer referenced.
    /// Returns the number of removed files.
    pub async fn cleanup(&self, referenced_urls: &[String]) -> AppResult<usize> {
        let referenced: HashSet<&str> = referenced_urls.iter().map(|s| s.as_str()).collect();
        let mut removed = 0usize;

        for shard in self.sandbox.list_dir(LOGO_DIR).await? {
            let shard_dir = format!("{LOGO_DIR}/{shard}");
            for file in self.sandbox.list_dir(&shard_dir).await? {
                if !file.ends_with(".meta") {
                    continue;
                }
                let meta_path = format!("{shard_dir}/{file}");
                let Ok(raw) = self.sandbox.read_to_string(&meta_path).await else {
                    continue;
                };
                let Ok(meta) = serde_json::from_str::<LogoMeta>(&raw) else {
                    warn!(path = %meta_path, "unreadable logo meta, skipping");
                    continue;
                };
                if referenced.contains(meta.original_url.as_str()) {
                    continue;
                }

                let data_path = meta_path.trim_end_matches(".meta").to_string();
                if self.sandbox.remove_file(&data_path).await.is_ok() {
                    removed += 1;
                }
                let _ = self.sandbox.remove_file(&meta_path).await;
                self.index.lock().await.remove(&meta.original_url);
            }
        }

        Ok(removed)
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("image/png") => "png",
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        Some("image/svg+xml") => "svg",
        _ => "img",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_follow_content_type() {
        assert_eq!(extension_for(Some("image/png")), "png");
        assert_eq!(extension_for(Some("image/jpeg; charset=binary")), "jpg");
        assert_eq!(extension_for(Some("application/octet-stream")), "img");
        assert_eq!(extension_for(None), "img");
    }
}
