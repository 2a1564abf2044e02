//! Command line client of the vision server.
//!
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::protocol::{
    DescribeRequest, DescribeResponse, DescriptionSource, DetectRequest, DetectResponse,
    DetectionHint, ErrorBody,
};
use env_logger::TimestampPrecision;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use vision_client::{annotate, encode_file_base64, summarize_detection};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the vision server to connect to
    #[clap(long, default_value = "127.0.0.1:5000")]
    address: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect objects on an image
    Detect {
        image: PathBuf,

        /// Write a copy of the image with drawn boxes to this path
        #[clap(long)]
        annotate: Option<PathBuf>,
    },
    /// Detect objects on an image and describe one of them
    Describe {
        image: PathBuf,

        /// Index of the detection to describe, most confident first
        #[clap(long, default_value_t = 0)]
        index: usize,
    },
}

async fn post<Req: Serialize, Resp: DeserializeOwned>(
    client: &Client,
    url: &str,
    body: &Req,
) -> Result<Resp> {
    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();
    let bytes = resp.bytes().await?;

    if !status.is_success() {
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(error) => bail!("{url} answered {status}: {}", error.error),
            Err(_) => bail!("{url} answered {status}"),
        }
    }

    serde_json::from_slice(&bytes).with_context(|| format!("unexpected answer from {url}"))
}

async fn detect(client: &Client, base: &str, image: &str) -> Result<DetectResponse> {
    post(
        client,
        &format!("{base}/object-detection"),
        &DetectRequest {
            image: Some(image.to_owned()),
        },
    )
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let base = format!("http://{}", args.address);
    let client = Client::new();

    match args.command {
        Command::Detect { image, annotate: out } => {
            let data = encode_file_base64(&image)?;
            let response = detect(&client, &base, &data).await?;
            log::info!("Server found {} objects", response.count);

            for detection in &response.detections {
                let [x1, y1, x2, y2] = detection.bbox;
                println!(
                    "{:<16} {:>5.1}%  [{x1:.0}, {y1:.0}, {x2:.0}, {y2:.0}]",
                    detection.class,
                    detection.confidence * 100.0
                );
            }
            println!("{}", summarize_detection(&response.detections));

            if let Some(out) = out {
                let frame = image::open(&image)?.to_rgb8();
                annotate(frame, &response.detections).save(&out)?;
                log::info!("Wrote annotated image to {}", out.display());
            }
        }
        Command::Describe { image, index } => {
            let data = encode_file_base64(&image)?;
            let mut detections = detect(&client, &base, &data).await?.detections;
            detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

            let hint = detections.get(index).map(DetectionHint::from);
            if hint.is_none() {
                log::warn!("No detection at index {index}, describing the whole image");
            }

            let response: DescribeResponse = post(
                &client,
                &format!("{base}/description"),
                &DescribeRequest {
                    image: Some(data),
                    detection: hint,
                },
            )
            .await?;
            let source = match response.source {
                DescriptionSource::Llm => "llm",
                DescriptionSource::Fallback => "fallback",
            };
            println!("[{source}] {}", response.description);
        }
    }

    Ok(())
}
