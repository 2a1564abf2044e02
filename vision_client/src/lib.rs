//! Helpers of the command line client of the vision server.
//!
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::Detection;
use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

/// Read an image file and encode it as a base64 data URI.
pub fn encode_file_base64(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    };

    Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

/// Draw bounding boxes of detections on the image.
///
/// Boxes are in pixel coordinates of the image and get clipped to its borders.
pub fn annotate(mut frame: RgbImage, detections: &[Detection]) -> RgbImage {
    let color = Rgb::from([0, 255, 0]);
    let (width, height) = (frame.width() as f32, frame.height() as f32);

    for detection in detections {
        // Coordinates of top-left and bottom-right points
        let [x_tl, y_tl, x_br, y_br] = detection.bbox;
        let (x_tl, y_tl) = (x_tl.clamp(0.0, width - 1.0), y_tl.clamp(0.0, height - 1.0));
        let (x_br, y_br) = (x_br.clamp(0.0, width - 1.0), y_br.clamp(0.0, height - 1.0));
        let rect_width = (x_br - x_tl).max(1.0);
        let rect_height = (y_br - y_tl).max(1.0);

        let rect = Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32);
        draw_hollow_rect_mut(&mut frame, rect, color);
    }

    frame
}

/// One line about the most confident detection.
pub fn summarize_detection(detections: &[Detection]) -> String {
    let best = detections
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

    match best {
        Some(detection) => format!(
            "Detected {} (confidence: {:.1}%).",
            detection.class,
            detection.confidence * 100.0
        ),
        None => "No objects were detected.".to_owned(),
    }
}
