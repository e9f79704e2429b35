//! Video catalog over the feeder server's REST API: `/videos`, `/feeders`, downloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feeder_core::{AddressError, ServerAddress};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoItem {
    pub filename: String,
    pub url: String,
}

/// HTTP client bound to one server address.
#[derive(Debug)]
pub struct CatalogClient {
    http: reqwest::Client,
    base: Url,
    address: String,
}

impl CatalogClient {
    pub fn new(address: &ServerAddress, timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: address.http_base_url(),
            address: address.as_str().to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn list_videos(&self) -> Result<Vec<VideoItem>, CatalogError> {
        self.get_json("videos").await
    }

    /// Ids of the feeders currently online.
    pub async fn list_feeders(&self) -> Result<Vec<String>, CatalogError> {
        self.get_json("feeders").await
    }

    /// Absolute URL of `item`; relative urls resolve against the server.
    pub fn video_url(&self, item: &VideoItem) -> Result<Url, CatalogError> {
        if item.url.trim().is_empty() {
            return Err(CatalogError::InvalidItem(format!("{:?}", item)));
        }
        self.base
            .join(&item.url)
            .map_err(|e| CatalogError::InvalidItem(format!("{}: {}", item.url, e)))
    }

    /// Save `item` as `dir/<sanitized filename>` and return the path written.
    pub async fn download(&self, item: &VideoItem, dir: &Path) -> Result<PathBuf, CatalogError> {
        if item.filename.trim().is_empty() {
            return Err(CatalogError::InvalidItem(format!("{:?}", item)));
        }
        let url = self.video_url(item)?;
        let dest = dir.join(sanitize_filename(&item.filename));
        info!(url = %url, dest = %dest.display(), "downloading video");

        let resp = self.http.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(CatalogError::Status {
                status: resp.status(),
                url: url.to_string(),
            });
        }
        tokio::fs::create_dir_all(dir).await?;
        match write_body(resp, &dest).await {
            Ok(written) => {
                debug!(bytes = written, "download complete");
                Ok(dest)
            }
            Err(e) => {
                warn!(dest = %dest.display(), "download failed, removing partial file: {}", e);
                if let Err(rm) = tokio::fs::remove_file(&dest).await {
                    debug!("removing partial file: {}", rm);
                }
                Err(e)
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T, CatalogError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| CatalogError::InvalidItem(e.to_string()))?;
        debug!(url = %url, "GET");
        let resp = self.http.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            warn!(url = %url, status = %resp.status(), "request failed");
            return Err(CatalogError::Status {
                status: resp.status(),
                url: url.to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}

async fn write_body(mut resp: reqwest::Response, dest: &Path) -> Result<u64, CatalogError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Replace characters that are not allowed in file names with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Hands out a [`CatalogClient`] for the configured address, rebuilding it when the address changes.
#[derive(Debug)]
pub struct Catalog {
    timeout: Duration,
    current: Option<Arc<CatalogClient>>,
}

impl Catalog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            current: None,
        }
    }

    pub fn service(&mut self, address: Option<&str>) -> Result<Arc<CatalogClient>, CatalogError> {
        let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
            warn!("server address is not set");
            self.current = None;
            return Err(CatalogError::NoAddress);
        };
        if let Some(client) = self.current.as_ref().filter(|c| c.address() == address) {
            return Ok(client.clone());
        }
        debug!(address, "building catalog client");
        let client = ServerAddress::parse(address)
            .map_err(CatalogError::from)
            .and_then(|a| CatalogClient::new(&a, self.timeout))
            .map(Arc::new);
        match client {
            Ok(c) => {
                self.current = Some(c.clone());
                Ok(c)
            }
            Err(e) => {
                self.current = None;
                Err(e)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("server address is not configured")]
    NoAddress,
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status} for {url}")]
    Status { status: reqwest::StatusCode, url: String },
    #[error("invalid video item: {0}")]
    InvalidItem(String),
    #[error("download I/O: {0}")]
    Io(#[from] std::io::Error),
}
