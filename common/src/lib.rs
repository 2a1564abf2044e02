//! Common code shared between `vision_server` and `vision_client`.
pub mod protocol;
