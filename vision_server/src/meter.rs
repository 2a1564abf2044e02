//! Request counters logged as rates.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    detections: AtomicU64,
    descriptions: AtomicU64,
    fallbacks: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            detections: AtomicU64::new(0),
            descriptions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn tick_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_description(&self) {
        self.descriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_detections(&self) -> u64 {
        self.detections.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_descriptions(&self) -> u64 {
        self.descriptions.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_fallbacks(&self) -> u64 {
        self.fallbacks.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger(period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(period);
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let detections = METER.get_reset_detections();
            let descriptions = METER.get_reset_descriptions();
            let fallbacks = METER.get_reset_fallbacks();
            let elapsed = start.elapsed().as_secs_f32();

            if detections > 0 {
                let rate = detections as f32 / elapsed;
                log::info!("Detection requests per second: {rate:.2}")
            }
            if descriptions > 0 {
                log::info!("Descriptions in last {elapsed:.0}s: {descriptions} ({fallbacks} fallback)")
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::Meter;

    #[test]
    fn test_counters_reset() {
        let meter = Meter::new();
        meter.tick_detection();
        meter.tick_detection();
        meter.tick_description();

        assert_eq!(meter.get_reset_detections(), 2);
        assert_eq!(meter.get_reset_detections(), 0);
        assert_eq!(meter.get_reset_descriptions(), 1);
        assert_eq!(meter.get_reset_fallbacks(), 0);
    }
}
