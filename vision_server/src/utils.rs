//! Utility functions
//!
use std::{
    fs::{self, File},
    io::Cursor,
    path::Path,
};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops, ImageOutputFormat, RgbImage};
use reqwest::Client;
use thiserror::Error;

/// Failure to turn a posted frame into an image.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("image data is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("failed to decode image: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// Download a file from a URL to a given filepath.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<Path>,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    if let Some(parent) = filepath.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

/// Decode a base64 frame, with or without a `data:` URI prefix, into RGB.
///
/// Whitespace anywhere in the payload is ignored.
pub fn decode_base64_image(data: &str) -> Result<RgbImage, FrameError> {
    let payload = match data.split_once(',') {
        Some((_prefix, payload)) => payload,
        None => data,
    };
    // Wrapped base64 (MIME style) carries line breaks
    let payload: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(payload)?;
    let image = image::load_from_memory(&bytes)?;

    Ok(image.to_rgb8())
}

/// Cut the region of a bounding box out of a frame.
///
/// The box is clamped to the frame. Without a box, or when nothing of it is
/// left after clamping, the whole frame is returned.
pub fn crop_to_bbox(image: &RgbImage, bbox: Option<[f32; 4]>) -> RgbImage {
    let (width, height) = image.dimensions();
    let Some([x1, y1, x2, y2]) = bbox else {
        return image.clone();
    };

    let x1 = x1.max(0.0).min(width as f32) as u32;
    let y1 = y1.max(0.0).min(height as f32) as u32;
    let x2 = x2.max(0.0).min(width as f32) as u32;
    let y2 = y2.max(0.0).min(height as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return image.clone();
    }

    imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image()
}

/// Encode an image as PNG inside a `data:` URI.
pub fn encode_png_data_uri(image: &RgbImage) -> Result<String, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageOutputFormat::Png)?;

    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buf.into_inner())
    ))
}
