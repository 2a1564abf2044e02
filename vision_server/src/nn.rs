//! YOLOv8 object detection on ONNX exports, run with tract.
//!
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use common::protocol::Detection;
use image::{imageops, RgbImage};
use ndarray::{s, ArrayView2, Ix3};
use tract_onnx::prelude::*;

use crate::utils::download_file;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Gray value YOLO pads letterboxed frames with.
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Class names of the COCO dataset, in the order the stock YOLOv8 weights use.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Something that finds objects in a frame.
pub trait InferModel: Send + Sync {
    fn run(&self, input: &RgbImage) -> Result<Vec<Detection>>;
}

/// Settings of a [`YoloModel`].
#[derive(Clone, Debug)]
pub struct YoloConfig {
    pub model_path: PathBuf,
    /// Side length of the square network input.
    pub input_size: u32,
    pub min_confidence: f32,
    pub max_iou: f32,
    pub max_detections: usize,
    pub labels: Vec<String>,
}

impl YoloConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            input_size: 640,
            min_confidence: 0.5,
            max_iou: 0.45,
            max_detections: 300,
            labels: COCO_CLASSES.iter().map(|name| name.to_string()).collect(),
        }
    }
}

pub struct YoloModel {
    model: NnModel,
    config: YoloConfig,
}

impl YoloModel {
    pub fn new(config: YoloConfig) -> Result<Self> {
        if config.input_size == 0 {
            bail!("model input size must be positive");
        }
        let size = config.input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(&config.model_path)
            .with_context(|| format!("failed to read model {}", config.model_path.display()))?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        log::info!(
            "Loaded model {} with input {size}x{size}",
            config.model_path.display()
        );

        Ok(Self { model, config })
    }

    fn preproc(&self, input: &RgbImage) -> (Tensor, Letterbox) {
        let size = self.config.input_size;
        let letterbox = Letterbox::fit(input.width(), input.height(), size);

        let resized: RgbImage = imageops::resize(
            input,
            letterbox.inner_width,
            letterbox.inner_height,
            imageops::FilterType::Triangle,
        );

        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| match letterbox.inner_coords(x as u32, y as u32) {
                Some((x, y)) => resized[(x, y)][c] as f32 / 255.0,
                None => PAD_VALUE,
            },
        )
        .into();

        (tensor, letterbox)
    }

    fn postproc(&self, raw_nn_out: TVec<TValue>, letterbox: &Letterbox) -> Result<Vec<Detection>> {
        // Output is [1, 4 + num_classes, num_anchors]: cx, cy, w, h followed by class scores
        let output = raw_nn_out[0]
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()?;
        if output.shape()[1] <= 4 {
            bail!("unexpected model output shape {:?}", output.shape());
        }

        let candidates = decode_predictions(
            output.slice(s![0, .., ..]),
            letterbox,
            self.config.min_confidence,
        );
        let mut selected = non_maximum_suppression(candidates, self.config.max_iou);
        selected.truncate(self.config.max_detections);

        Ok(selected
            .into_iter()
            .map(|candidate| Detection {
                class: label_for(&self.config.labels, candidate.class_id),
                confidence: candidate.confidence,
                bbox: candidate.bbox,
            })
            .collect())
    }
}

impl InferModel for YoloModel {
    fn run(&self, input: &RgbImage) -> Result<Vec<Detection>> {
        let (tensor, letterbox) = self.preproc(input);
        let raw_nn_out = self.model.run(tvec!(tensor.into()))?;
        self.postproc(raw_nn_out, &letterbox)
    }
}

/// Make sure the model file exists, downloading it from `url` if it does not.
pub async fn fetch_model(path: &Path, url: Option<&str>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    match url {
        Some(url) => {
            log::info!("Downloading model from {url} to {}", path.display());
            download_file(&reqwest::Client::new(), url, path)
                .await
                .with_context(|| format!("failed to download model from {url}"))
        }
        None => bail!(
            "model file {} not found and no download URL configured; \
             export one with `yolo export model=yolov8n.pt format=onnx`",
            path.display()
        ),
    }
}

/// Read class names from a file with one name per line.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Placement of a frame inside the square network input.
///
/// The frame is scaled to fit while keeping its aspect ratio and centered;
/// the rest is padding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    inner_width: u32,
    inner_height: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);
        let inner_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let inner_height = ((height as f32 * scale).round() as u32).clamp(1, size);

        Self {
            scale,
            pad_x: (size - inner_width) / 2,
            pad_y: (size - inner_height) / 2,
            inner_width,
            inner_height,
            width,
            height,
        }
    }

    /// Coordinates inside the resized frame, or `None` on padding.
    fn inner_coords(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        let x = x.checked_sub(self.pad_x)?;
        let y = y.checked_sub(self.pad_y)?;
        (x < self.inner_width && y < self.inner_height).then_some((x, y))
    }

    /// Map a `[cx, cy, w, h]` box of the network input to `[x1, y1, x2, y2]`
    /// in pixels of the source frame.
    pub fn to_source(&self, cxcywh: [f32; 4]) -> [f32; 4] {
        let [cx, cy, w, h] = cxcywh;
        let unpad_x = |x: f32| ((x - self.pad_x as f32) / self.scale).clamp(0.0, self.width as f32);
        let unpad_y =
            |y: f32| ((y - self.pad_y as f32) / self.scale).clamp(0.0, self.height as f32);

        [
            unpad_x(cx - w / 2.0),
            unpad_y(cy - h / 2.0),
            unpad_x(cx + w / 2.0),
            unpad_y(cy + h / 2.0),
        ]
    }
}

/// Box proposed by the network before suppression.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Turn raw predictions of shape `[4 + num_classes, num_anchors]` into
/// candidates whose best class score reaches `min_confidence`.
pub fn decode_predictions(
    predictions: ArrayView2<f32>,
    letterbox: &Letterbox,
    min_confidence: f32,
) -> Vec<Candidate> {
    let num_classes = predictions.nrows().saturating_sub(4);
    if num_classes == 0 {
        return vec![];
    }

    predictions
        .columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, confidence) = column
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (idx, score)| {
                    if score > best.1 {
                        (idx, score)
                    } else {
                        best
                    }
                });
            if confidence < min_confidence {
                return None;
            }

            let bbox = letterbox.to_source([column[0], column[1], column[2], column[3]]);
            Some(Candidate {
                class_id,
                confidence,
                bbox,
            })
        })
        .collect()
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other
/// bounding boxes in the order of sinking confidence. Keep only those
/// candidates which do not overlap an already selected box of the same class
/// with an IoU above `max_iou`. The result is sorted by descending confidence.
pub fn non_maximum_suppression(mut candidates: Vec<Candidate>, max_iou: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Candidate> = vec![];
    'candidates: loop {
        // Get next most confident bbox from the back of ascending-sorted vector.
        match candidates.pop() {
            Some(candidate) => {
                for other in selected.iter() {
                    if other.class_id == candidate.class_id
                        && iou(&candidate.bbox, &other.bbox) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are
    // ill defined and its area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bottom-right point lies above or to the left of the top-left point,
/// the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
