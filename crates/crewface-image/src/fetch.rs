//! Remote photo retrieval with bounded retries and content validation.

use crewface_core::{retry_with_backoff, RetryPolicy};
use image::ImageFormat;
use reqwest::header::CONTENT_TYPE;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a byte buffer was rejected as an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidImage {
    #[error("empty body")]
    Empty,
    #[error("{size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("unexpected content type `{0}`")]
    ContentType(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("image does not decode: {0}")]
    Undecodable(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("image not found at {url} (HTTP {status})")]
    NotFound { url: String, status: u16 },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("invalid content from {url}: {reason}")]
    InvalidContent {
        url: String,
        #[source]
        reason: InvalidImage,
    },
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    NotFound,
    Timeout,
    InvalidContent,
    NetworkError,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "NotFound",
            Self::Timeout => "Timeout",
            Self::InvalidContent => "InvalidContent",
            Self::NetworkError => "NetworkError",
        })
    }
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::NotFound { .. } => FetchErrorKind::NotFound,
            Self::Timeout { .. } => FetchErrorKind::Timeout,
            Self::InvalidContent { .. } => FetchErrorKind::InvalidContent,
            Self::Network { .. } => FetchErrorKind::NetworkError,
        }
    }

    /// Everything but a 4xx is worth another attempt: servers under load
    /// sometimes answer with an error page or a truncated body.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }

    fn from_reqwest(url: &Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { url: url.to_string() }
        } else {
            Self::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum FetcherInitError {
    #[error("base URL `{0}` cannot carry path segments")]
    CannotBeABase(String),
    #[error("HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: Url,
    pub timeout: Duration,
    pub max_bytes: usize,
    pub retry: RetryPolicy,
}

impl FetchConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }
}

/// A downloaded image that passed validation.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: Url,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Header facts about a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Check that `bytes` is a non-empty, size-bounded JPEG or PNG that decodes.
pub fn validate_image(bytes: &[u8], max_bytes: usize) -> Result<ImageInfo, InvalidImage> {
    if bytes.is_empty() {
        return Err(InvalidImage::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(InvalidImage::TooLarge { size: bytes.len(), max: max_bytes });
    }

    let format =
        image::guess_format(bytes).map_err(|e| InvalidImage::UnsupportedFormat(e.to_string()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(InvalidImage::UnsupportedFormat(format!("{format:?}")));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| InvalidImage::Undecodable(e.to_string()))?;

    Ok(ImageInfo {
        format,
        width: decoded.width(),
        height: decoded.height(),
    })
}

/// Fetches subject photos from `<base_url>/<subject_id>/<filename>`.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ImageFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetcherInitError> {
        if config.base_url.cannot_be_a_base() {
            return Err(FetcherInitError::CannotBeABase(config.base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("crewface/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Source URL for a subject's photo. Both parts are escaped as single
    /// path segments.
    pub fn image_url(&self, subject_id: &str, filename: &str) -> Url {
        let mut url = self.config.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(subject_id).push(filename);
        }
        url
    }

    /// Download and validate a subject's photo, retrying transient failures.
    pub async fn fetch(
        &self,
        subject_id: &str,
        filename: &str,
    ) -> Result<FetchedImage, FetchError> {
        let url = self.image_url(subject_id, filename);
        retry_with_backoff(
            &self.config.retry,
            "fetch_image",
            |e: &FetchError| e.is_retryable(),
            |attempt| self.fetch_once(&url, attempt),
        )
        .await
    }

    async fn fetch_once(&self, url: &Url, attempt: u32) -> Result<FetchedImage, FetchError> {
        tracing::debug!(%url, attempt, "downloading image");
        let invalid = |reason| FetchError::InvalidContent { url: url.to_string(), reason };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::NotFound {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let max = self.config.max_bytes;
        if let Some(len) = response.content_length() {
            if len > max as u64 {
                return Err(invalid(InvalidImage::TooLarge { size: len as usize, max }));
            }
        }
        if let Some(ct) = response.headers().get(CONTENT_TYPE) {
            let ct = ct.to_str().unwrap_or_default().to_ascii_lowercase();
            if !ct.starts_with("image/") {
                return Err(invalid(InvalidImage::ContentType(ct)));
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
        {
            if bytes.len() + chunk.len() > max {
                return Err(invalid(InvalidImage::TooLarge {
                    size: bytes.len() + chunk.len(),
                    max,
                }));
            }
            bytes.extend_from_slice(&chunk);
        }

        let info = validate_image(&bytes, max).map_err(invalid)?;
        tracing::debug!(
            %url,
            bytes = bytes.len(),
            width = info.width,
            height = info.height,
            "image downloaded"
        );

        Ok(FetchedImage {
            url: url.clone(),
            bytes,
            format: info.format,
            width: info.width,
            height: info.height,
        })
    }
}
