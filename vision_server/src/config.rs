//! Command line and environment configuration of the server.
//!
use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    llm::{LlmClient, DEFAULT_BASE_URL, DEFAULT_MODEL},
    nn::{load_labels, YoloConfig},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Config {
    /// Host to bind the HTTP server to
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP server to
    #[clap(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// YOLOv8 ONNX export, defaults to `yolov8n.onnx` in the user cache directory
    #[clap(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// URL to download the model from when the file is missing
    #[clap(long, env = "MODEL_URL")]
    pub model_url: Option<String>,

    /// Class names, one per line, for models not trained on COCO
    #[clap(long, env = "LABELS_PATH")]
    pub labels: Option<PathBuf>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640, value_parser = clap::value_parser!(u32).range(32..=4096))]
    pub input_size: u32,

    /// Minimum confidence of reported detections
    #[clap(long, env = "CONFIDENCE_THRESHOLD", default_value_t = 0.5, value_parser = parse_unit_interval)]
    pub confidence: f32,

    /// IoU above which overlapping boxes of one class are suppressed
    #[clap(long, default_value_t = 0.45, value_parser = parse_unit_interval)]
    pub iou: f32,

    /// Maximum number of detections per frame
    #[clap(long, default_value_t = 300)]
    pub max_detections: usize,

    /// Key of the chat-completion API; `LLM_API_KEY` is read as well
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Multimodal model used for descriptions
    #[clap(long, env = "LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub llm_model: String,

    /// Base URL of the chat-completion API
    #[clap(long, env = "LLM_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub llm_base_url: String,

    /// CSV log of encyclopedia entries
    #[clap(long, env = "ENCYCLOPEDIA_CSV", default_value = "data/Encyclopedia.csv")]
    pub encyclopedia_csv: PathBuf,

    /// Seconds between request rate log lines
    #[clap(long, default_value_t = 10)]
    pub meter_interval_secs: u64,
}

fn parse_unit_interval(value: &str) -> Result<f32, String> {
    let value: f32 = value.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not between 0 and 1"))
    }
}

impl Config {
    pub fn bind_address(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .with_context(|| format!("invalid bind address {addr}"))
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vision_server")
                .join("yolov8n.onnx")
        })
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("LLM_API_KEY").ok())
    }

    pub fn yolo_config(&self) -> Result<YoloConfig> {
        let mut config = YoloConfig::new(self.model_path());
        config.input_size = self.input_size;
        config.min_confidence = self.confidence;
        config.max_iou = self.iou;
        config.max_detections = self.max_detections;
        if let Some(labels) = &self.labels {
            config.labels = load_labels(labels)?;
        }

        Ok(config)
    }

    pub fn llm_client(&self) -> LlmClient {
        LlmClient::new(self.api_key())
            .with_base_url(&self.llm_base_url)
            .with_model(&self.llm_model)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_args() {
        let config = Config::try_parse_from([
            "vision_server",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--model-path",
            "models/yolov8s.onnx",
            "--confidence",
            "0.25",
        ])
        .unwrap();

        assert_eq!(config.bind_address().unwrap().to_string(), "127.0.0.1:8080");
        assert_eq!(config.model_path(), PathBuf::from("models/yolov8s.onnx"));

        let yolo = config.yolo_config().unwrap();
        assert_eq!(yolo.min_confidence, 0.25);
        assert_eq!(yolo.input_size, 640);
        assert_eq!(yolo.labels.len(), 80);
    }

    #[test]
    fn test_reject_thresholds_out_of_range() {
        assert!(Config::try_parse_from(["vision_server", "--confidence", "1.5"]).is_err());
        assert!(Config::try_parse_from(["vision_server", "--iou", "-0.1"]).is_err());
    }

    #[test]
    fn test_reject_input_size_out_of_range() {
        assert!(Config::try_parse_from(["vision_server", "--input-size", "0"]).is_err());
        assert!(Config::try_parse_from(["vision_server", "--input-size", "8192"]).is_err());

        let config = Config::try_parse_from(["vision_server", "--input-size", "320"]).unwrap();
        assert_eq!(config.yolo_config().unwrap().input_size, 320);
    }

    #[test]
    fn test_custom_labels() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.txt");
        std::fs::write(&labels, "ripe\n\nunripe\n").unwrap();

        let config = Config::try_parse_from([
            "vision_server",
            "--labels",
            labels.to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(config.yolo_config().unwrap().labels, vec!["ripe", "unripe"]);
    }
}
