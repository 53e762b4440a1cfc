use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder};
use thiserror::Error;

use crate::images::types::{CropPolicy, Focus, ImageFormat, TransformSpec};

pub const DEFAULT_QUALITY: u8 = 85;

/// Largest output side the optimizer will produce, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

// ravif speed: 1 (slowest, smallest) to 10 (fastest).
const AVIF_SPEED: u8 = 8;

#[derive(Error, Debug)]
pub enum ImageProxyError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Source not allowed: {0}")]
    ForbiddenSource(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Image conversion error: {0}")]
    ConversionError(String),
}

// Convert image according to the transform spec
pub fn convert_image(image_data: &[u8], spec: &TransformSpec) -> Result<(Vec<u8>, ImageFormat), ImageProxyError> {
    let img = image::load_from_memory(image_data)
        .map_err(|e| ImageProxyError::ConversionError(format!("Failed to load image: {}", e)))?;

    let processed_img = apply_transformations(img, spec)?;

    encode_image(processed_img, spec)
}

fn apply_transformations(mut img: DynamicImage, spec: &TransformSpec) -> Result<DynamicImage, ImageProxyError> {
    if spec.width.is_some() || spec.height.is_some() {
        img = resize_image(img, spec)?;
    }

    if let Some(blur) = spec.blur.filter(|b| *b > 0) {
        // bl-1..100 maps onto a gaussian sigma of 0.5..50
        img = img.blur(blur.min(100) as f32 / 2.0);
    }

    Ok(img)
}

fn resize_image(img: DynamicImage, spec: &TransformSpec) -> Result<DynamicImage, ImageProxyError> {
    let (current_width, current_height) = img.dimensions();
    if current_width == 0 || current_height == 0 {
        return Err(ImageProxyError::ConversionError("Image has no pixels".to_string()));
    }

    let (target_width, target_height) = match (spec.width, spec.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale_side(w, current_height, current_width)),
        (None, Some(h)) => (scale_side(h, current_width, current_height), h),
        (None, None) => return Ok(img),
    };
    let (target_width, target_height) = (target_width.max(1), target_height.max(1));
    check_output_size(target_width, target_height)?;

    let resized_img = match spec.crop.unwrap_or(CropPolicy::MaintainRatio) {
        CropPolicy::Force => img.resize_exact(target_width, target_height, FilterType::Lanczos3),
        CropPolicy::AtMax => img.resize(target_width, target_height, FilterType::Lanczos3),
        CropPolicy::AtLeast => {
            let (scaled_width, scaled_height) = cover_dimensions(img.dimensions(), target_width, target_height);
            check_output_size(scaled_width, scaled_height)?;
            img.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3)
        }
        CropPolicy::MaintainRatio => {
            // Crop the source to the target ratio around the focus point, then scale once
            let (x, y, width, height) =
                crop_region(img.dimensions(), target_width, target_height, spec.focus.unwrap_or(Focus::Center));
            img.crop_imm(x, y, width, height)
                .resize_exact(target_width, target_height, FilterType::Lanczos3)
        }
    };

    Ok(resized_img)
}

// `side * numerator / denominator`, rounded and saturated.
fn scale_side(side: u32, numerator: u32, denominator: u32) -> u32 {
    let scaled = (side as f64 * numerator as f64 / denominator as f64).round();
    scaled.min(u32::MAX as f64) as u32
}

fn check_output_size(width: u32, height: u32) -> Result<(), ImageProxyError> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ImageProxyError::ConversionError(format!(
            "Output size {}x{} exceeds the {}px limit",
            width, height, MAX_DIMENSION
        )));
    }
    Ok(())
}

// Smallest size keeping the aspect ratio with both sides >= the target.
fn cover_dimensions((width, height): (u32, u32), target_width: u32, target_height: u32) -> (u32, u32) {
    let scale_x = target_width as f64 / width as f64;
    let scale_y = target_height as f64 / height as f64;
    let scale = scale_x.max(scale_y);
    (
        ((width as f64 * scale).ceil().min(u32::MAX as f64) as u32).max(target_width),
        ((height as f64 * scale).ceil().min(u32::MAX as f64) as u32).max(target_height),
    )
}

// Largest region of the source with the target's aspect ratio, placed at the focus.
fn crop_region(
    (width, height): (u32, u32),
    target_width: u32,
    target_height: u32,
    focus: Focus,
) -> (u32, u32, u32, u32) {
    let source_wider = width as u64 * target_height as u64 > height as u64 * target_width as u64;
    let (region_width, region_height) = if source_wider {
        (scale_side(height, target_width, target_height).clamp(1, width), height)
    } else {
        (width, scale_side(width, target_height, target_width).clamp(1, height))
    };

    let spare_x = width - region_width;
    let spare_y = height - region_height;
    let (x, y) = match focus {
        Focus::Center => (spare_x / 2, spare_y / 2),
        Focus::Top => (spare_x / 2, 0),
        Focus::Bottom => (spare_x / 2, spare_y),
        Focus::Left => (0, spare_y / 2),
        Focus::Right => (spare_x, spare_y / 2),
        Focus::TopLeft => (0, 0),
        Focus::TopRight => (spare_x, 0),
        Focus::BottomLeft => (0, spare_y),
        Focus::BottomRight => (spare_x, spare_y),
    };

    (x, y, region_width, region_height)
}

fn encode_image(img: DynamicImage, spec: &TransformSpec) -> Result<(Vec<u8>, ImageFormat), ImageProxyError> {
    let mut output = Vec::new();
    let quality = spec.quality.unwrap_or(DEFAULT_QUALITY).clamp(1, 100);
    let format = match spec.format {
        None | Some(ImageFormat::Auto) => ImageFormat::Jpg,
        Some(format) => format,
    };

    match format {
        ImageFormat::Avif => {
            let rgba = img.to_rgba8();
            image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut output, AVIF_SPEED, quality)
                .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)
                .map_err(|e| ImageProxyError::ConversionError(format!("AVIF encoding failed: {}", e)))?;
        }
        ImageFormat::Webp => {
            img.write_to(&mut std::io::Cursor::new(&mut output), image::ImageFormat::WebP)
                .map_err(|e| ImageProxyError::ConversionError(format!("WebP encoding failed: {}", e)))?;
        }
        ImageFormat::Png => {
            img.write_to(&mut std::io::Cursor::new(&mut output), image::ImageFormat::Png)
                .map_err(|e| ImageProxyError::ConversionError(format!("PNG encoding failed: {}", e)))?;
        }
        ImageFormat::Jpg | ImageFormat::Auto => {
            // JPEG has no alpha channel
            let rgb = img.to_rgb8();
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            encoder
                .encode_image(&rgb)
                .map_err(|e| ImageProxyError::ConversionError(format!("JPEG encoding failed: {}", e)))?;
        }
    }

    Ok((output, format))
}

/// Sniffs an image content type from magic numbers.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if data.starts_with(b"GIF8") {
        Some("image/gif")
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        Some("image/webp")
    } else if data.get(4..8) == Some(&b"ftyp"[..]) && matches!(data.get(8..12), Some(b"avif") | Some(b"avis")) {
        Some("image/avif")
    } else {
        None
    }
}
