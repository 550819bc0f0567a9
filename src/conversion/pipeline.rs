//! End-to-end conversion of one submitted reference: resolve, fetch into the
//! working directory, convert, and map the artifact to a public reference.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::conversion::converter::{CommandConverter, ConversionInvoker};
use crate::conversion::source::{
    DocumentSource, HttpFetcher, LocalFetcher, SameOriginRule, SourceFetcher, SourceResolver, UPLOADS_PREFIX,
};
use crate::error::ConversionError;
use crate::worker::job::{Workload, WorkloadRunner};

/// Fetched copy of the source document, removed when dropped so it is
/// cleaned up even if the conversion is aborted.
struct TempSource(PathBuf);

impl Drop for TempSource {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Failed to remove temporary source");
            }
        }
    }
}

pub struct ConversionPipeline {
    resolver: SourceResolver,
    remote: Arc<dyn SourceFetcher>,
    local: Arc<dyn SourceFetcher>,
    invoker: Arc<dyn ConversionInvoker>,
    uploads_dir: PathBuf,
}

impl ConversionPipeline {
    pub fn new(
        resolver: SourceResolver,
        remote: Arc<dyn SourceFetcher>,
        local: Arc<dyn SourceFetcher>,
        invoker: Arc<dyn ConversionInvoker>,
        uploads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            remote,
            local,
            invoker,
            uploads_dir: uploads_dir.into(),
        }
    }

    /// HTTP downloads, uploads-directory copies, and the configured converter binary.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConversionError> {
        Ok(Self::new(
            SourceResolver::new(SameOriginRule::new(config.converter.same_origin_hosts.clone())),
            Arc::new(HttpFetcher::new(config.converter.download_timeout)?),
            Arc::new(LocalFetcher::new(config.uploads_dir.clone())),
            Arc::new(CommandConverter::from_config(&config.converter)),
            config.uploads_dir.clone(),
        ))
    }

    /// `/uploads/<rel>` when the artifact lives under the uploads directory,
    /// otherwise its filesystem path.
    pub fn public_reference(&self, artifact: &Path) -> String {
        match artifact.strip_prefix(&self.uploads_dir) {
            Ok(rel) => {
                let parts: Vec<_> = rel
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_string_lossy()),
                        _ => None,
                    })
                    .collect();
                format!("{UPLOADS_PREFIX}{}", parts.join("/"))
            }
            Err(_) => artifact.display().to_string(),
        }
    }

    async fn convert(
        &self,
        source: &DocumentSource,
        temp: &Path,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ConversionError> {
        let fetcher = match source {
            DocumentSource::Remote(_) => &self.remote,
            DocumentSource::Upload(_) => &self.local,
        };

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
            fetched = fetcher.fetch(source, temp) => fetched?,
        };
        debug!(kind = source.kind(), bytes, "Source fetched");

        if cancel.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConversionError::Cancelled),
            converted = self.invoker.invoke(temp, work_dir) => converted,
        }
    }
}

#[async_trait]
impl WorkloadRunner for ConversionPipeline {
    async fn run(&self, workload: &Workload, cancel: &CancellationToken) -> Result<String, ConversionError> {
        let source = self.resolver.resolve(&workload.source)?;
        tokio::fs::create_dir_all(&workload.work_dir).await?;

        let temp = TempSource(
            workload
                .work_dir
                .join(format!("{:016x}_source.pdf", rand::random::<u64>())),
        );
        let artifact = self.convert(&source, &temp.0, &workload.work_dir, cancel).await?;
        drop(temp);

        Ok(self.public_reference(&artifact))
    }
}
