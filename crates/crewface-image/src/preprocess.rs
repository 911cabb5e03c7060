//! Photo normalization ahead of face detection.
//!
//! Decode, apply the EXIF orientation, bring the image into a size window,
//! then run CLAHE on luma so badly lit portraits still detect.

use crewface_core::NormalizedImage;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;
pub const DEFAULT_MIN_DIMENSION: u32 = 160;
pub const DEFAULT_CLAHE_TILES: u32 = 8;
pub const DEFAULT_CLAHE_CLIP_LIMIT: f32 = 2.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("cannot decode image: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConfig {
    pub max_dimension: u32,
    pub min_dimension: u32,
    /// Tiles per axis; the grid is square.
    pub clahe_tiles: u32,
    /// Histogram clip as a multiple of the mean bin height of a tile.
    pub clahe_clip_limit: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            min_dimension: DEFAULT_MIN_DIMENSION,
            clahe_tiles: DEFAULT_CLAHE_TILES,
            clahe_clip_limit: DEFAULT_CLAHE_CLIP_LIMIT,
        }
    }
}

/// Decode `bytes` and normalize orientation, size and contrast.
pub fn preprocess(
    bytes: &[u8],
    config: &PreprocessConfig,
) -> Result<NormalizedImage, PreprocessError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| PreprocessError::Decode(e.to_string()))?;
    let (source_width, source_height) = (decoded.width(), decoded.height());

    let oriented = match exif_orientation(bytes) {
        Some(orientation) if orientation != 1 => {
            tracing::debug!(orientation, "applying EXIF orientation");
            apply_orientation(decoded, orientation)
        }
        _ => decoded,
    };

    let mut pixels = oriented.into_rgb8();
    if let Some((w, h)) = target_size(
        pixels.width(),
        pixels.height(),
        config.min_dimension,
        config.max_dimension,
    ) {
        let filter = if w < pixels.width() { FilterType::Triangle } else { FilterType::CatmullRom };
        tracing::debug!(
            from_w = pixels.width(),
            from_h = pixels.height(),
            to_w = w,
            to_h = h,
            "resizing"
        );
        pixels = imageops::resize(&pixels, w, h, filter);
    }

    equalize_luma(&mut pixels, config.clahe_tiles, config.clahe_clip_limit);

    Ok(NormalizedImage {
        pixels,
        source_width,
        source_height,
    })
}

/// EXIF orientation tag (1–8) if the container carries one.
pub fn exif_orientation(bytes: &[u8]) -> Option<u32> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).filter(|o| (1..=8).contains(o))
}

/// Rotate/flip so the image displays upright.
pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.fliph().rotate270(),
        6 => image.rotate90(),
        7 => image.fliph().rotate90(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// New dimensions when the image falls outside `[min_dim, max_dim]`, or
/// `None` when it already fits.
pub fn target_size(width: u32, height: u32, min_dim: u32, max_dim: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let long = width.max(height) as f64;
    let short = width.min(height) as f64;

    let scale = if long > max_dim as f64 {
        max_dim as f64 / long
    } else if short < min_dim as f64 {
        (min_dim as f64 / short).min(max_dim as f64 / long)
    } else {
        return None;
    };

    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    if (w, h) == (width, height) {
        None
    } else {
        Some((w, h))
    }
}

/// BT.601 luma.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// CLAHE on the luma plane; each channel is shifted by the luma change so
/// hue is roughly preserved.
pub fn equalize_luma(img: &mut RgbImage, tiles: u32, clip_limit: f32) {
    let (w, h) = img.dimensions();
    let before: Vec<u8> = img.pixels().map(|p| luma(p[0], p[1], p[2])).collect();
    let mut after = before.clone();
    clahe_enhance(&mut after, w, h, tiles, clip_limit);

    for ((p, &old), &new) in img.pixels_mut().zip(&before).zip(&after) {
        let delta = new as i16 - old as i16;
        if delta == 0 {
            continue;
        }
        for c in 0..3 {
            p[c] = (p[c] as i16 + delta).clamp(0, 255) as u8;
        }
    }
}

/// Contrast-Limited Adaptive Histogram Equalization on a grayscale plane.
///
/// Per-tile clipped histograms become lookup tables; each pixel blends the
/// four nearest tile tables bilinearly.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                let line = &gray[y * w + col * tile_w..y * w + (col + 1) * tile_w];
                for &v in line {
                    hist[v as usize] += 1;
                }
            }
            luts.push(tile_lut(&mut hist, tile_w * tile_h, clip_limit));
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let v = gray[y * w + x] as usize;
            let top = luts[r0 * t + c0][v] * (1.0 - dx) + luts[r0 * t + c1][v] * dx;
            let bot = luts[r1 * t + c0][v] * (1.0 - dx) + luts[r1 * t + c1][v] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip `hist`, spread the excess evenly, and return the normalized CDF.
/// A tile whose CDF is degenerate (a single occupied bin that survives
/// clipping) maps to identity.
fn tile_lut(hist: &mut [u32; 256], tile_pixels: usize, clip_limit: f32) -> [f32; 256] {
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let leftover = (excess % 256) as usize;
    let step = if leftover > 0 { 256 / leftover } else { 0 };
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share;
        if step > 0 && i % step == 0 && i / step < leftover {
            *bin += 1;
        }
    }

    let mut cdf = [0f32; 256];
    let mut acc = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        acc += count as f32;
        *slot = acc;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = acc - cdf_min;
    if denom <= 0.0 {
        let mut identity = [0f32; 256];
        for (i, v) in identity.iter_mut().enumerate() {
            *v = i as f32;
        }
        return identity;
    }
    for v in cdf.iter_mut() {
        *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
    }
    cdf
}
