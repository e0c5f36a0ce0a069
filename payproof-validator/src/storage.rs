//! Proof image retrieval
//!
//! The pipeline only reads uploads by URL. Failing to read the image is the
//! one fatal condition of a validation run.

use crate::types::ProofImage;
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default cap on upload size
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Image retrieval errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("file:// URLs are disabled (no storage root configured)")]
    LocalFilesDisabled,

    #[error("path is outside the storage root: {0}")]
    OutsideRoot(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage returned {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image is empty")]
    Empty,

    #[error("image exceeds {0} bytes")]
    TooLarge(usize),
}

/// Object storage read access
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, file_type: &str) -> Result<ProofImage, FetchError>;
}

/// Reads `http(s)://` URLs with reqwest and, when a storage root is
/// configured, `file://` URLs below that root
pub struct HttpImageFetcher {
    http_client: Client,
    local_root: Option<PathBuf>,
    max_image_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            http_client,
            local_root: None,
            max_image_bytes: MAX_IMAGE_BYTES,
        })
    }

    /// Allow `file://` URLs that resolve inside `root`
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    pub fn with_max_image_bytes(mut self, max_image_bytes: usize) -> Self {
        self.max_image_bytes = max_image_bytes;
        self
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len > self.max_image_bytes as u64)
        {
            return Err(FetchError::TooLarge(self.max_image_bytes));
        }

        // Content-Length may be absent or wrong; enforce the cap while reading
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Network(e.without_url().to_string()))?
        {
            if bytes.len() + chunk.len() > self.max_image_bytes {
                return Err(FetchError::TooLarge(self.max_image_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    async fn fetch_file(&self, raw_path: &str) -> Result<Vec<u8>, FetchError> {
        let Some(root) = &self.local_root else {
            return Err(FetchError::LocalFilesDisabled);
        };
        let path = resolve_under_root(root, raw_path).await?;

        let len = tokio::fs::metadata(&path).await?.len();
        if len > self.max_image_bytes as u64 {
            return Err(FetchError::TooLarge(self.max_image_bytes));
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

/// Canonical path of `raw_path` if it lies inside `root`
///
/// Relative paths are taken from the root. Symlinks and `..` are resolved
/// before the containment check.
async fn resolve_under_root(root: &Path, raw_path: &str) -> Result<PathBuf, FetchError> {
    let root = tokio::fs::canonicalize(root).await?;
    let candidate = root.join(raw_path);
    let resolved = tokio::fs::canonicalize(&candidate).await?;
    if !resolved.starts_with(&root) {
        warn!(path = raw_path, "Rejected file URL outside storage root");
        return Err(FetchError::OutsideRoot(raw_path.to_string()));
    }
    Ok(resolved)
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, file_type: &str) -> Result<ProofImage, FetchError> {
        let bytes = if let Some(path) = url.strip_prefix("file://") {
            self.fetch_file(path).await?
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url).await?
        } else {
            let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or(url);
            return Err(FetchError::UnsupportedScheme(scheme.to_string()));
        };

        if bytes.is_empty() {
            return Err(FetchError::Empty);
        }

        debug!(url, bytes = bytes.len(), "Proof image fetched");
        Ok(ProofImage::new(bytes, file_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use std::io::Write;

    fn fetcher_in(root: &Path) -> HttpImageFetcher {
        HttpImageFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_local_root(root)
    }

    /// Serve `app` on an ephemeral port and return its base URL
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_file_url_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"\x89PNG fake").unwrap();
        let url = format!("file://{}", file.path().display());

        let image = fetcher_in(dir.path()).fetch(&url, "image/png").await.unwrap();
        assert_eq!(&*image.bytes, b"\x89PNG fake");
        assert_eq!(image.file_type, "image/png");
    }

    #[tokio::test]
    async fn test_relative_file_url_resolves_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("proofs")).unwrap();
        std::fs::write(dir.path().join("proofs").join("a.png"), b"png").unwrap();

        let image = fetcher_in(dir.path())
            .fetch("file://proofs/a.png", "image/png")
            .await
            .unwrap();
        assert_eq!(&*image.bytes, b"png");
    }

    #[tokio::test]
    async fn test_file_url_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher_in(dir.path());

        let err = fetcher.fetch("file:///etc/passwd", "image/png").await.unwrap_err();
        assert!(matches!(err, FetchError::OutsideRoot(_)), "{}", err);

        let err = fetcher
            .fetch("file://../../../../etc/passwd", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::OutsideRoot(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_file_urls_disabled_without_root() {
        let err = HttpImageFetcher::new(Duration::from_secs(1))
            .unwrap()
            .fetch("file:///etc/passwd", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::LocalFilesDisabled));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher_in(dir.path())
            .fetch("file://missing/proof.png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let url = format!("file://{}", file.path().display());
        let err = fetcher_in(dir.path()).fetch(&url, "image/png").await.unwrap_err();
        assert!(matches!(err, FetchError::Empty));
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.png"), vec![7u8; 2048]).unwrap();
        let err = fetcher_in(dir.path())
            .with_max_image_bytes(1024)
            .fetch("file://big.png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge(1024)));
    }

    #[tokio::test]
    async fn test_unbounded_chunked_body_is_cut_off() {
        // Never-ending body without Content-Length
        let app = Router::new().route(
            "/proof.png",
            get(|| async {
                let chunks = futures::stream::repeat_with(|| {
                    Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(vec![0u8; 16 * 1024]))
                });
                Body::from_stream(chunks)
            }),
        );
        let base = serve(app).await;

        let err = HttpImageFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_max_image_bytes(64 * 1024)
            .fetch(&format!("{}/proof.png", base), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_http_body_within_cap_is_read() {
        let app = Router::new().route("/proof.png", get(|| async { vec![1u8; 4096] }));
        let base = serve(app).await;

        let image = HttpImageFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_max_image_bytes(64 * 1024)
            .fetch(&format!("{}/proof.png", base), "image/png")
            .await
            .unwrap();
        assert_eq!(image.len(), 4096);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let err = HttpImageFetcher::new(Duration::from_secs(1))
            .unwrap()
            .fetch("s3://bucket/key.png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "s3"));
    }
}
