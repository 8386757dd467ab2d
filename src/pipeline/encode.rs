//! Image encoding: file bytes → base64 [`EncodedImage`].
//!
//! Hosted providers receive the original file bytes; the validator already
//! capped their size. Resource-constrained providers get a downscaled JPEG:
//! decoding, resizing and re-encoding are CPU-bound, so that path runs in
//! `spawn_blocking` to keep the async workers free.

use crate::error::Img2MdError;
use crate::pipeline::input::{mime_type_for, ImageDescriptor};
use crate::pipeline::plan::Batch;
use crate::provider::{EncodedImage, ImagePolicy};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::debug;

/// Encode one image under `policy`.
pub async fn encode_image(
    image: &ImageDescriptor,
    policy: ImagePolicy,
) -> Result<EncodedImage, Img2MdError> {
    let bytes = tokio::fs::read(&image.path)
        .await
        .map_err(|e| encoding_error(image, e.to_string()))?;

    let (mime_type, data) = match policy {
        ImagePolicy::Original => (mime_type_for(&image.path).to_string(), STANDARD.encode(&bytes)),
        ImagePolicy::Downscale {
            max_dimension,
            jpeg_quality,
        } => {
            let jpeg = tokio::task::spawn_blocking(move || {
                downscale_to_jpeg(&bytes, max_dimension, jpeg_quality)
            })
            .await
            .map_err(|e| Img2MdError::Internal(format!("encode task panicked: {e}")))?
            .map_err(|e| encoding_error(image, e))?;
            ("image/jpeg".to_string(), STANDARD.encode(&jpeg))
        }
    };

    debug!("Encoded {} → {} bytes base64", image.filename, data.len());
    Ok(EncodedImage {
        mime_type,
        data,
        source: image.filename.clone(),
    })
}

/// Encode every image of a batch, preserving order.
pub async fn encode_batch(
    batch: &Batch,
    policy: ImagePolicy,
) -> Result<Vec<EncodedImage>, Img2MdError> {
    futures::future::try_join_all(batch.images.iter().map(|img| encode_image(img, policy))).await
}

/// Decode, shrink so the longest edge is ≤ `max_dimension`, and re-encode as
/// RGB JPEG. Images already within bounds are only re-encoded.
pub fn downscale_to_jpeg(bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

fn encoding_error(image: &ImageDescriptor, detail: String) -> Img2MdError {
    Img2MdError::ImageEncoding {
        path: image.path.clone(),
        detail,
    }
}
