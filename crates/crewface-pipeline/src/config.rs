use crewface_core::{DistanceMetric, MatchConfig, OnnxExtractorConfig, RetryPolicy};
use crewface_image::{FetchConfig, PreprocessConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const STORE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Pipeline configuration, loaded once from environment variables and then
/// passed by value to every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root the photo URLs are built from.
    pub image_base_url: Url,
    pub matching: MatchConfig,
    /// Minimum score gap between the best and second-best match.
    pub ambiguity_margin: f32,
    pub model_name: String,
    pub detector_backend: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding database.
    pub db_path: PathBuf,
    /// Database holding the read-only `crew` roster table.
    pub roster_db_path: PathBuf,
    pub max_image_bytes: usize,
    pub fetch_timeout: Duration,
    pub fetch_max_retries: u32,
    pub fetch_backoff: Duration,
    pub extract_max_retries: u32,
    pub store_max_retries: u32,
    pub preprocess: PreprocessConfig,
    /// Subjects processed at once. 1 is sequential.
    pub batch_concurrency: usize,
    /// Pause between subjects.
    pub batch_delay: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let raw_url = var("IMAGE_BASE_URL").ok_or(ConfigError::Missing("IMAGE_BASE_URL"))?;
        let image_base_url = Url::parse(raw_url.trim()).map_err(|e| ConfigError::Invalid {
            key: "IMAGE_BASE_URL",
            value: raw_url.clone(),
            reason: e.to_string(),
        })?;
        if image_base_url.cannot_be_a_base()
            || !matches!(image_base_url.scheme(), "http" | "https")
        {
            return Err(ConfigError::Invalid {
                key: "IMAGE_BASE_URL",
                value: raw_url,
                reason: "expected an http(s) base URL".into(),
            });
        }

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("crewface");

        let model_dir = var("CREWFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));
        let db_path = var("CREWFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("crewface.db"));
        let roster_db_path = var("CREWFACE_ROSTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| db_path.clone());

        let confidence_threshold = parse(&var, "FACE_CONFIDENCE_THRESHOLD", 0.70f32)?;
        in_range("FACE_CONFIDENCE_THRESHOLD", confidence_threshold, 0.0, 1.0)?;
        let distance_threshold = parse(&var, "FACE_DISTANCE_THRESHOLD", 0.40f32)?;
        in_range("FACE_DISTANCE_THRESHOLD", distance_threshold, 0.0, 2.0)?;
        let ambiguity_margin = parse(&var, "FACE_AMBIGUITY_MARGIN", 0.10f32)?;
        in_range("FACE_AMBIGUITY_MARGIN", ambiguity_margin, 0.0, 1.0)?;

        let metric = parse(&var, "FACE_DISTANCE_METRIC", DistanceMetric::Cosine)?;
        let max_matches =
            at_least_one("MAX_FACE_MATCHES", parse(&var, "MAX_FACE_MATCHES", 5usize)?)?;

        let preprocess = PreprocessConfig {
            max_dimension: parse(&var, "PREPROCESS_MAX_DIMENSION", 1024u32)?,
            min_dimension: parse(&var, "PREPROCESS_MIN_DIMENSION", 160u32)?,
            ..PreprocessConfig::default()
        };
        if preprocess.min_dimension == 0 || preprocess.min_dimension > preprocess.max_dimension {
            return Err(ConfigError::Invalid {
                key: "PREPROCESS_MIN_DIMENSION",
                value: preprocess.min_dimension.to_string(),
                reason: format!(
                    "must be between 1 and PREPROCESS_MAX_DIMENSION ({})",
                    preprocess.max_dimension
                ),
            });
        }

        Ok(Self {
            image_base_url,
            matching: MatchConfig {
                metric,
                distance_threshold,
                confidence_threshold,
                max_matches,
            },
            ambiguity_margin,
            model_name: var("FACE_MODEL_NAME").unwrap_or_else(|| "Facenet512".to_string()),
            detector_backend: var("FACE_DETECTOR_BACKEND").unwrap_or_else(|| "mtcnn".to_string()),
            model_dir,
            db_path,
            roster_db_path,
            max_image_bytes: at_least_one(
                "MAX_IMAGE_BYTES",
                parse(&var, "MAX_IMAGE_BYTES", 10 * 1024 * 1024usize)?,
            )?,
            fetch_timeout: Duration::from_secs(at_least_one(
                "FETCH_TIMEOUT_SECS",
                parse(&var, "FETCH_TIMEOUT_SECS", 30u64)?,
            )?),
            fetch_max_retries: parse(&var, "FETCH_MAX_RETRIES", 3u32)?,
            fetch_backoff: Duration::from_millis(parse(&var, "FETCH_BACKOFF_MS", 500u64)?),
            extract_max_retries: parse(&var, "EXTRACT_MAX_RETRIES", 2u32)?,
            store_max_retries: parse(&var, "STORE_MAX_RETRIES", 2u32)?,
            preprocess,
            batch_concurrency: at_least_one(
                "BATCH_CONCURRENCY",
                parse(&var, "BATCH_CONCURRENCY", 1usize)?,
            )?,
            batch_delay: Duration::from_millis(parse(&var, "BATCH_DELAY_MS", 500u64)?),
        })
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            base_url: self.image_base_url.clone(),
            timeout: self.fetch_timeout,
            max_bytes: self.max_image_bytes,
            retry: RetryPolicy::new(self.fetch_max_retries, self.fetch_backoff),
        }
    }

    pub fn extractor_config(&self) -> OnnxExtractorConfig {
        OnnxExtractorConfig {
            model_dir: self.model_dir.clone(),
            model_name: self.model_name.clone(),
            detector_backend: self.detector_backend.clone(),
            min_face_confidence: self.matching.confidence_threshold,
        }
    }

    pub fn extract_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.extract_max_retries, self.fetch_backoff)
    }

    pub fn store_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_max_retries, STORE_BACKOFF)
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn in_range(key: &'static str, value: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: format!("must be within [{min}, {max}]"),
        })
    }
}

fn at_least_one<T>(key: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + From<u8> + ToString,
{
    if value >= T::from(1) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        })
    }
}
