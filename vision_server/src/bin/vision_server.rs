//! Vision server binary.
//!
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use vision_server::{
    app::{router, AppState},
    config::Config,
    encyclopedia::EncyclopediaStore,
    meter::spawn_meter_logger,
    nn::{fetch_model, YoloModel},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Load the detector once, all requests share it
    let yolo_config = config.yolo_config()?;
    fetch_model(&yolo_config.model_path, config.model_url.as_deref()).await?;
    let model = tokio::task::spawn_blocking(move || YoloModel::new(yolo_config)).await??;

    let llm = config.llm_client();
    if !llm.has_api_key() {
        log::warn!("No language model API key configured, descriptions use the fallback");
    }

    let state = Arc::new(AppState {
        model: Arc::new(model),
        captioner: Arc::new(llm.clone()),
        llm,
        store: EncyclopediaStore::new(&config.encyclopedia_csv),
    });

    spawn_meter_logger(Duration::from_secs(config.meter_interval_secs.max(1)));

    // Serve HTTP server
    let addr = config.bind_address()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await?;

    Ok(())
}
