use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const ACCEPTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];
pub const MAX_FILE_BYTES: usize = 4 * 1024 * 1024;
pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_DIMENSION: u32 = 600;
pub const JPEG_QUALITY: u8 = 60;
pub const FILE_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unsupported image type {0}")]
    UnsupportedType(String),
    #[error("image {name} is {size} bytes, limit is 4 MiB")]
    TooLarge { name: String, size: usize },
    #[error("images total {total} bytes, limit is 10 MiB")]
    BatchTooLarge { total: usize },
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode image: {0}")]
    Encode(String),
}

/// Raw upload as received from a caller.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub file_name: Option<String>,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn from_base64(
        file_name: Option<String>,
        mime_type: &str,
        data: &str,
    ) -> Result<Self, ImageError> {
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|err| ImageError::Decode(err.to_string()))?;
        Ok(Self {
            file_name,
            mime_type: mime_type.trim().to_ascii_lowercase(),
            bytes,
        })
    }

    fn label(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| "upload".into())
    }
}

/// Base64 payload ready to be attached to a model prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

fn check_file(file: &ImageFile) -> Result<(), ImageError> {
    if !ACCEPTED_MIME_TYPES.contains(&file.mime_type.as_str()) {
        return Err(ImageError::UnsupportedType(file.mime_type.clone()));
    }
    if file.bytes.len() > MAX_FILE_BYTES {
        return Err(ImageError::TooLarge {
            name: file.label(),
            size: file.bytes.len(),
        });
    }
    Ok(())
}

/// Type and size checks for a whole batch. Nothing is decoded here.
pub fn validate_batch(files: &[ImageFile]) -> Result<(), ImageError> {
    files.iter().try_for_each(check_file)?;
    let total: usize = files.iter().map(|file| file.bytes.len()).sum();
    if total > MAX_BATCH_BYTES {
        return Err(ImageError::BatchTooLarge { total });
    }
    Ok(())
}

fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { ((u16::from(channel) * alpha + 255 * (255 - alpha)) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

/// Decode, downscale to fit `max_dimension`, flatten onto white and
/// re-encode as JPEG. Blocking; call from the blocking pool.
pub fn normalize_with(
    file: &ImageFile,
    max_dimension: u32,
    quality: u8,
) -> Result<EncodedImage, ImageError> {
    check_file(file)?;
    let format = ImageFormat::from_mime_type(&file.mime_type)
        .ok_or_else(|| ImageError::UnsupportedType(file.mime_type.clone()))?;
    let decoded = image::load_from_memory_with_format(&file.bytes, format)
        .map_err(|err| ImageError::Decode(err.to_string()))?;

    let flattened = DynamicImage::ImageRgb8(flatten_on_white(&decoded));
    let fitted = if flattened.width().max(flattened.height()) > max_dimension {
        flattened.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        flattened
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(&fitted)
        .map_err(|err| ImageError::Encode(err.to_string()))?;
    debug!(
        target = "inventory.images",
        name = %file.label(),
        width = fitted.width(),
        height = fitted.height(),
        in_bytes = file.bytes.len(),
        out_bytes = bytes.len(),
        "image_normalized"
    );
    Ok(EncodedImage {
        mime_type: "image/jpeg".into(),
        data: BASE64.encode(bytes),
    })
}

pub fn normalize(file: &ImageFile) -> Result<EncodedImage, ImageError> {
    normalize_with(file, MAX_DIMENSION, JPEG_QUALITY)
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    pub max_dimension: u32,
    pub quality: u8,
    pub file_gap: Duration,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            quality: JPEG_QUALITY,
            file_gap: FILE_GAP,
        }
    }
}

impl Normalizer {
    /// Normalizes files one at a time, pausing between files.
    pub async fn normalize_batch(
        &self,
        files: Vec<ImageFile>,
    ) -> Result<Vec<EncodedImage>, ImageError> {
        validate_batch(&files)?;
        let count = files.len();
        let mut encoded = Vec::with_capacity(count);
        for (index, file) in files.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.file_gap).await;
            }
            let (max_dimension, quality) = (self.max_dimension, self.quality);
            let image = tokio::task::spawn_blocking(move || normalize_with(&file, max_dimension, quality))
                .await
                .map_err(|err| ImageError::Encode(err.to_string()))??;
            encoded.push(image);
        }
        info!(target = "inventory.images", count, "image_batch_normalized");
        Ok(encoded)
    }
}
