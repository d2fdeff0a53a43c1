//! # eurostat-fetch
//!
//! Deterministic acquisition of remote artifacts with caching and
//! retries (spec.md §4.1). `Fetcher` owns the local file cache and the
//! network retry/backoff policy; every download streams straight to
//! disk, so this crate never buffers a whole file in memory.

mod retry;

use std::path::{Path, PathBuf};
use std::time::Duration;

use eurostat_core::error::PipelineError;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub use retry::RetryPolicy;

/// Fetches and caches the four artifact kinds described in spec.md §4.1:
/// the inventory, SDMX DSD/codelist documents, and the gzip TSV matrix.
pub struct Fetcher {
    client: reqwest::Client,
    base_url: String,
    cache_root: PathBuf,
    cache_enabled: bool,
    retry_policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(base_url: impl Into<String>, cache_root: impl Into<PathBuf>, cache_enabled: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Fetcher {
            client,
            base_url: base_url.into(),
            cache_root: cache_root.into(),
            cache_enabled,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Table of Contents: per-dataset `(id, last_update)` inventory.
    pub async fn get_inventory(&self) -> Result<PathBuf, PipelineError> {
        let url = format!("{}/sdmx/2.1/bulk/toc/txt", self.base_url);
        self.cached_download("inventory.tsv", &url).await
    }

    /// SDMX-ML Data Structure Definition document for `dataset_id`.
    pub async fn get_dsd(&self, dataset_id: &str) -> Result<PathBuf, PipelineError> {
        let url = format!("{}/sdmx/2.1/datastructure/ESTAT/{dataset_id}", self.base_url);
        self.cached_download(&format!("dsd_{dataset_id}.xml"), &url)
            .await
    }

    /// SDMX-ML codelist document for code list `id`.
    pub async fn get_codelist(&self, id: &str) -> Result<PathBuf, PipelineError> {
        let url = format!("{}/sdmx/2.1/codelist/ESTAT/{id}", self.base_url);
        self.cached_download(&format!("cl_{id}.xml"), &url).await
    }

    /// Compressed TSV data matrix for `dataset_id`.
    pub async fn get_tsv(&self, dataset_id: &str) -> Result<PathBuf, PipelineError> {
        let url = format!("{}/sdmx/2.1/data/{dataset_id}?format=TSV&compressed=true", self.base_url);
        self.cached_download(&format!("{dataset_id}.tsv.gz"), &url)
            .await
    }

    async fn cached_download(&self, cache_name: &str, url: &str) -> Result<PathBuf, PipelineError> {
        let dest = self.cache_root.join(cache_name);
        if self.cache_enabled {
            match tokio::fs::metadata(&dest).await {
                Ok(_) => {
                    debug!(path = %dest.display(), "cache hit");
                    return Ok(dest);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(error = %e, "cache metadata lookup failed, bypassing cache for this artifact");
                }
            }
        }

        let tmp = self.download_to_temp(url).await?;
        if self.cache_enabled {
            self.promote_to_cache(&tmp, &dest).await?;
            Ok(dest)
        } else {
            Ok(tmp)
        }
    }

    /// Download `url` to a fresh temp file, retrying transient
    /// transport errors and 5xx responses with exponential backoff and
    /// jitter. 404/401/403 are terminal and not retried.
    async fn download_to_temp(&self, url: &str) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .map_err(|e| PipelineError::CacheIoError {
                path: self.cache_root.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut last_err: Option<String> = None;
        for attempt in 0..self.retry_policy.max_attempts {
            if attempt > 0 {
                let delay = self.retry_policy.delay_for(attempt);
                tokio::time::sleep(delay).await;
            }

            match self.try_download_once(url).await {
                Ok(path) => return Ok(path),
                Err(DownloadAttemptError::NotFound) => {
                    return Err(PipelineError::FetchNotFound {
                        resource: url.to_string(),
                    });
                }
                Err(DownloadAttemptError::Transient(reason)) => {
                    warn!(url, attempt, %reason, "transient fetch failure, retrying");
                    last_err = Some(reason);
                }
            }
        }

        Err(PipelineError::FetchTransient {
            resource: url.to_string(),
            attempts: self.retry_policy.max_attempts,
            reason: last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        })
    }

    async fn try_download_once(&self, url: &str) -> Result<PathBuf, DownloadAttemptError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadAttemptError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 404 || status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(DownloadAttemptError::NotFound);
        }
        if retry::is_retryable_status(status.as_u16()) {
            return Err(DownloadAttemptError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DownloadAttemptError::Transient(format!("HTTP {status}")));
        }

        let tmp_path = self.cache_root.join(format!(".tmp-{}", uuid_like()));
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| DownloadAttemptError::Transient(e.to_string()))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadAttemptError::Transient(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadAttemptError::Transient(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| DownloadAttemptError::Transient(e.to_string()))?;

        info!(url, path = %tmp_path.display(), "download complete");
        Ok(tmp_path)
    }

    /// Atomically publish a downloaded temp file into the cache:
    /// write-to-temp (already done by the caller) then rename, so
    /// concurrent readers never observe a partial file.
    async fn promote_to_cache(&self, tmp: &Path, dest: &Path) -> Result<PathBuf, PipelineError> {
        tokio::fs::rename(tmp, dest)
            .await
            .map_err(|e| PipelineError::CacheIoError {
                path: dest.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(dest.to_path_buf())
    }
}

enum DownloadAttemptError {
    NotFound,
    Transient(String),
}

fn uuid_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_hit_avoids_network_and_returns_cached_path() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("inventory.tsv");
        tokio::fs::write(&cached, b"code\ttype\tlast update of data\n").await.unwrap();

        let fetcher = Fetcher::new("http://127.0.0.1:1", dir.path(), true).unwrap();
        let path = fetcher.cached_download("inventory.tsv", "http://127.0.0.1:1/should-not-be-hit").await.unwrap();
        assert_eq!(path, cached);
    }

    #[tokio::test]
    async fn not_found_is_terminal_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        // Port 1 has nothing listening, so send() itself fails transiently;
        // exercise the status-code branch with a local test server instead
        // would require extra deps, so here we verify the classification
        // function directly used by the fetch path.
        assert!(!retry::is_retryable_status(404));
        let _ = dir; // keep tempdir alive for symmetry with other cache tests
    }
}
