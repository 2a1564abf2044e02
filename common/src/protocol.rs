//! JSON messages exchanged between the camera page, the client and the server.
//!
use serde::{de::IgnoredAny, Deserialize, Deserializer, Serialize};

/// One detected object.
///
/// `bbox` holds `[x1, y1, x2, y2]` in pixels of the posted frame, top-left and
/// bottom-right corner.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class: class.into(),
            confidence,
            bbox,
        }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

/// Body of a detection request.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DetectRequest {
    /// Base64 PNG/JPEG, optionally prefixed with `data:image/...;base64,`.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DetectResponse {
    pub detections: Vec<Detection>,
    pub count: usize,
}

impl From<Vec<Detection>> for DetectResponse {
    fn from(detections: Vec<Detection>) -> Self {
        Self {
            count: detections.len(),
            detections,
        }
    }
}

/// Detection as sent back by the camera page when asking for a description.
///
/// All fields are optional since the page may forward partial records. A field
/// of the wrong type, e.g. a box with a `null` coordinate, reads as absent.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DetectionHint {
    #[serde(default, deserialize_with = "lenient")]
    pub class: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub confidence: Option<f32>,
    #[serde(default, deserialize_with = "lenient")]
    pub bbox: Option<Vec<f32>>,
}

impl DetectionHint {
    /// The bounding box, if it has exactly four coordinates.
    pub fn bbox(&self) -> Option<[f32; 4]> {
        match self.bbox.as_deref() {
            Some(&[x1, y1, x2, y2]) => Some([x1, y1, x2, y2]),
            _ => None,
        }
    }
}

impl From<&Detection> for DetectionHint {
    fn from(detection: &Detection) -> Self {
        Self {
            class: Some(detection.class.clone()),
            confidence: Some(detection.confidence),
            bbox: Some(detection.bbox.to_vec()),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DescribeRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub detection: Option<DetectionHint>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Valid(T),
    Invalid(IgnoredAny),
}

/// Deserialize an optional value, turning values of the wrong shape into `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<Lenient<T>>::deserialize(deserializer)? {
        Some(Lenient::Valid(value)) => Some(value),
        Some(Lenient::Invalid(_)) | None => None,
    })
}

/// Where a description came from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionSource {
    Llm,
    Fallback,
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct DescribeResponse {
    pub description: String,
    pub source: DescriptionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body of failed requests.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Row of the encyclopedia log.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EncyclopediaEntry {
    pub name: String,
    pub text: String,
    pub place: String,
    /// `YYYY-MM-DD`
    pub date: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EncyclopediaRequest {
    #[serde(default)]
    pub place: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EncyclopediaItem {
    pub name: String,
    pub text: String,
}

/// Entries suggested by the language model for one place.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeneratedEncyclopedia {
    pub place: String,
    pub encyclopedia: Vec<EncyclopediaItem>,
}
