//! Descriptions of detected objects, with a templated fallback.
//!
use async_trait::async_trait;
use common::protocol::{DescriptionSource, DetectionHint};
use image::RgbImage;

/// Something that writes a caption for the selected part of a frame.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, image: &RgbImage, hint: &DetectionHint) -> anyhow::Result<String>;
}

/// Ask the captioner for a description and fall back to a templated sentence
/// on any failure.
pub async fn describe_with_fallback(
    captioner: &dyn Captioner,
    image: &RgbImage,
    hint: Option<&DetectionHint>,
) -> (String, DescriptionSource) {
    let empty = DetectionHint::default();
    match captioner.caption(image, hint.unwrap_or(&empty)).await {
        Ok(description) => (description, DescriptionSource::Llm),
        Err(e) => {
            log::warn!("Captioning failed, using fallback: {e:#}");
            (
                fallback_description(hint, Some(&format!("{e:#}"))),
                DescriptionSource::Fallback,
            )
        }
    }
}

/// Compose a description from the detection record alone.
///
/// Mentions the label, the confidence and the rough size of the box when
/// those are known, and appends `error` as detail.
pub fn fallback_description(hint: Option<&DetectionHint>, error: Option<&str>) -> String {
    let label = hint
        .and_then(|hint| hint.class.as_deref())
        .unwrap_or("An unknown object");

    let confidence_text = match hint.and_then(|hint| hint.confidence) {
        Some(confidence) => format!(" (confidence {:.1}%)", confidence * 100.0),
        None => String::new(),
    };

    let size_text = match hint.and_then(DetectionHint::bbox) {
        Some([x1, y1, x2, y2]) => {
            let width = f32::max(x2 - x1, 1.0) as i64;
            let height = f32::max(y2 - y1, 1.0) as i64;
            format!(" It spans roughly {width}x{height} pixels.")
        }
        None => String::new(),
    };

    let mut description = format!(
        "{label}{confidence_text} is in view.{size_text} \
         A simplified description is shown because the language model is unavailable."
    );

    if let Some(error) = error.filter(|error| !error.is_empty()) {
        description.push_str(" Details: ");
        description.push_str(error);
    }

    description
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;

    struct FixedCaptioner(Option<&'static str>);

    #[async_trait]
    impl Captioner for FixedCaptioner {
        async fn caption(&self, _image: &RgbImage, _hint: &DetectionHint) -> anyhow::Result<String> {
            self.0
                .map(str::to_owned)
                .ok_or_else(|| anyhow!("no key configured"))
        }
    }

    fn elephant() -> DetectionHint {
        DetectionHint {
            class: Some("elephant".into()),
            confidence: Some(0.873),
            bbox: Some(vec![10.0, 20.0, 130.5, 100.0]),
        }
    }

    #[test]
    fn test_full_fallback() {
        assert_eq!(
            fallback_description(Some(&elephant()), Some("timeout")),
            "elephant (confidence 87.3%) is in view. It spans roughly 120x80 pixels. \
             A simplified description is shown because the language model is unavailable. \
             Details: timeout"
        );
    }

    #[test]
    fn test_fallback_with_partial_hint() {
        assert_eq!(
            fallback_description(None, None),
            "An unknown object is in view. \
             A simplified description is shown because the language model is unavailable."
        );

        // Degenerate and malformed boxes
        let hint = DetectionHint {
            class: Some("cup".into()),
            confidence: None,
            bbox: Some(vec![50.0, 50.0, 50.0, 40.0]),
        };
        assert!(fallback_description(Some(&hint), Some(""))
            .starts_with("cup is in view. It spans roughly 1x1 pixels."));

        let hint = DetectionHint {
            bbox: Some(vec![1.0, 2.0]),
            ..Default::default()
        };
        assert!(!fallback_description(Some(&hint), None).contains("spans"));
    }

    #[tokio::test]
    async fn test_describe_with_fallback() {
        let image = RgbImage::new(4, 4);

        let (text, source) =
            describe_with_fallback(&FixedCaptioner(Some("A grey elephant.")), &image, None).await;
        assert_eq!(text, "A grey elephant.");
        assert_eq!(source, DescriptionSource::Llm);

        let hint = elephant();
        let (text, source) = describe_with_fallback(&FixedCaptioner(None), &image, Some(&hint)).await;
        assert_eq!(source, DescriptionSource::Fallback);
        assert!(text.starts_with("elephant (confidence 87.3%)"));
        assert!(text.ends_with("Details: no key configured"));
    }
}
