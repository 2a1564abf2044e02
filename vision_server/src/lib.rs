//! Object detection and description for camera frames posted by a browser.

pub mod app;
pub mod config;
pub mod describe;
pub mod encyclopedia;
pub mod endpoints;
pub mod llm;
pub mod meter;
pub mod nn;
pub mod utils;
