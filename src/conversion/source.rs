//! Document sources: classifying a submitted reference and fetching it into
//! the working directory.
//!
//! Two kinds exist:
//! - remote URLs, downloaded over HTTP
//! - same-origin upload URLs (`http://<our host>/uploads/<file>`), copied
//!   straight from the uploads directory

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::ConversionError;

/// URL path prefix under which uploads are served.
pub const UPLOADS_PREFIX: &str = "/uploads/";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Where a document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    /// Downloaded from an arbitrary URL.
    Remote(Url),
    /// Path relative to the uploads directory.
    Upload(PathBuf),
}

impl DocumentSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote(_) => "remote",
            Self::Upload(_) => "upload",
        }
    }
}

/// Decides which URLs point back at this service's own uploads.
#[derive(Debug, Clone)]
pub struct SameOriginRule {
    /// Lowercased `host` or `host:port` entries.
    authorities: Vec<String>,
}

impl SameOriginRule {
    pub fn new<I, S>(authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            authorities: authorities
                .into_iter()
                .map(|a| a.into().trim().to_ascii_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    /// True when the URL's authority is listed, either as `host:port` or as a
    /// bare host. Scheme-default ports count as explicit ones.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let with_port = url.port_or_known_default().map(|port| format!("{host}:{port}"));

        self.authorities
            .iter()
            .any(|a| *a == host || with_port.as_deref() == Some(a.as_str()))
    }
}

/// Turns a submitted reference into a [`DocumentSource`].
#[derive(Debug, Clone)]
pub struct SourceResolver {
    rule: SameOriginRule,
}

impl SourceResolver {
    pub fn new(rule: SameOriginRule) -> Self {
        Self { rule }
    }

    pub fn resolve(&self, reference: &str) -> Result<DocumentSource, ConversionError> {
        let reference = reference.trim();

        // Bare upload path, as returned by the upload endpoint.
        if let Some(rel) = reference.strip_prefix(UPLOADS_PREFIX) {
            return upload_path(rel).map(DocumentSource::Upload);
        }

        let url = Url::parse(reference)
            .map_err(|e| ConversionError::InvalidSource(format!("{reference}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConversionError::InvalidSource(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if self.rule.matches(&url) {
            let rel = url.path().strip_prefix(UPLOADS_PREFIX).ok_or_else(|| {
                ConversionError::InvalidSource(format!(
                    "same-origin path {} is outside {UPLOADS_PREFIX}",
                    url.path()
                ))
            })?;
            return upload_path(rel).map(DocumentSource::Upload);
        }

        Ok(DocumentSource::Remote(url))
    }
}

/// Validate a path relative to the uploads root.
fn upload_path(rel: &str) -> Result<PathBuf, ConversionError> {
    let path = PathBuf::from(rel);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if rel.is_empty() || escapes {
        return Err(ConversionError::InvalidSource(format!(
            "invalid upload path '{rel}'"
        )));
    }
    Ok(path)
}

/// Places a document at a destination path inside the working directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Write `source` to `dest`, returning the number of bytes written.
    async fn fetch(&self, source: &DocumentSource, dest: &Path) -> Result<u64, ConversionError>;
}

/// Streams remote documents over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ConversionError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/pdf"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ConversionError::Fetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &DocumentSource, dest: &Path) -> Result<u64, ConversionError> {
        let DocumentSource::Remote(url) = source else {
            return Err(ConversionError::InvalidSource(format!(
                "HTTP fetcher cannot handle {} sources",
                source.kind()
            )));
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ConversionError::Fetch(describe_reqwest(&e)))?
            .error_for_status()
            .map_err(|e| ConversionError::Fetch(describe_reqwest(&e)))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ConversionError::Fetch(describe_reqwest(&e)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(url = %url, bytes = written, "Downloaded source document");
        Ok(written)
    }
}

fn describe_reqwest(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else {
        e.to_string()
    }
}

/// Copies documents out of the uploads directory.
pub struct LocalFetcher {
    uploads_dir: PathBuf,
}

impl LocalFetcher {
    pub fn new(uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for LocalFetcher {
    async fn fetch(&self, source: &DocumentSource, dest: &Path) -> Result<u64, ConversionError> {
        let DocumentSource::Upload(rel) = source else {
            return Err(ConversionError::InvalidSource(format!(
                "local fetcher cannot handle {} sources",
                source.kind()
            )));
        };

        let path = self.uploads_dir.join(rel);
        if !tokio::fs::try_exists(&path).await? {
            return Err(ConversionError::SourceMissing(path.display().to_string()));
        }

        let bytes = tokio::fs::copy(&path, dest).await?;
        debug!(from = %path.display(), to = %dest.display(), bytes, "Copied uploaded document");
        Ok(bytes)
    }
}
