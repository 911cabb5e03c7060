//! crewface-image — getting subject photos into a detectable shape.
//!
//! [`fetch`] downloads and validates remote photos; [`preprocess`] fixes
//! orientation, size and contrast before extraction.

pub mod fetch;
pub mod preprocess;

pub use fetch::{
    validate_image, FetchConfig, FetchError, FetchErrorKind, FetchedImage, FetcherInitError,
    ImageFetcher, ImageInfo, InvalidImage,
};
pub use preprocess::{preprocess, PreprocessConfig, PreprocessError};
