//! Metrics and image reporting for a training run.
//!
//! The [`Logger`] keeps the current iteration and fans every record out to its sinks.
//! A failing sink is reported with `warn!` and never interrupts training.

pub mod sinks;

use std::path::Path;

use burn::prelude::*;
use image::RgbImage;
use thiserror::Error;
use tracing::warn;

use crate::config::TrainingConfig;
use crate::utils::{make_grid, normalize_each};
pub use sinks::{FileSink, HttpSink};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dashboard request failed: {0}")]
    Http(String),
}

/// A destination for scalars and image grids, keyed by iteration.
pub trait MetricsSink: Send {
    fn name(&self) -> &str;
    fn scalar(&mut self, name: &str, value: f64, iteration: usize) -> Result<(), SinkError>;
    fn image(&mut self, name: &str, image: &RgbImage, iteration: usize) -> Result<(), SinkError>;
}

pub struct Logger {
    sinks: Vec<Box<dyn MetricsSink>>,
    iteration: usize,
    per_row: usize,
    padding: usize,
}

impl Logger {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self {
            sinks,
            iteration: 0,
            per_row: 8,
            padding: 2,
        }
    }

    /// Local files under `run_dir/logs`, plus the dashboard when one is configured.
    pub fn from_config(config: &TrainingConfig, run_dir: &Path) -> Self {
        let mut sinks: Vec<Box<dyn MetricsSink>> =
            vec![Box::new(FileSink::new(run_dir.join("logs")))];
        if let Some(url) = config.dashboard_url.as_deref() {
            match HttpSink::new(url) {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(err) => warn!(url, error = %err, "dashboard disabled"),
            }
        }
        Self::new(sinks)
    }

    /// Tag everything logged from now on with `iteration`.
    pub fn begin_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    /// Log each `(name, batch)` pair as one grid; every image is min-max normalized on its own.
    ///
    /// Tensors must be `[batch, channels, H, W]` with 1 or 3 channels; others are skipped.
    pub fn log_images<B: Backend>(&mut self, images: Vec<(&str, Tensor<B, 4>)>) {
        for (name, tensor) in images {
            let dims = tensor.dims();
            let grid = tensor
                .detach()
                .into_data()
                .to_vec::<f32>()
                .ok()
                .and_then(|mut data| {
                    normalize_each(&mut data, dims[0]);
                    make_grid(&data, dims, self.per_row, self.padding)
                });
            let Some(grid) = grid else {
                warn!(name, ?dims, "cannot render image batch");
                continue;
            };
            for sink in &mut self.sinks {
                if let Err(err) = sink.image(name, &grid, self.iteration) {
                    warn!(sink = sink.name(), name, error = %err, "failed to log image");
                }
            }
        }
    }

    pub fn log_scalars(&mut self, scalars: &[(&str, f64)]) {
        for sink in &mut self.sinks {
            for &(name, value) in scalars {
                if let Err(err) = sink.scalar(name, value, self.iteration) {
                    warn!(sink = sink.name(), name, error = %err, "failed to log scalar");
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn records_carry_the_current_iteration() {
        let sink = RecordingSink::default();
        let mut logger = Logger::new(vec![Box::new(sink.clone())]);

        logger.begin_iteration(11);
        logger.log_scalars(&[("gan/D Loss", 0.5), ("gan/G Loss", -0.25)]);
        logger.begin_iteration(12);
        logger.log_scalars(&[("Epoch", 1.0)]);

        let scalars = sink.scalars.lock().expect("lock").clone();
        assert_eq!(
            scalars,
            vec![
                ("gan/D Loss".to_string(), 0.5, 11),
                ("gan/G Loss".to_string(), -0.25, 11),
                ("Epoch".to_string(), 1.0, 12),
            ]
        );
    }

    #[test]
    fn a_failing_sink_does_not_stop_the_others() {
        let broken = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let healthy = RecordingSink::default();
        let mut logger = Logger::new(vec![Box::new(broken), Box::new(healthy.clone())]);

        let device = Default::default();
        logger.begin_iteration(1);
        logger.log_scalars(&[("Iteration", 1.0)]);
        logger.log_images(vec![(
            "mask/training",
            Tensor::<TestBackend, 4>::ones([2, 1, 4, 4], &device),
        )]);

        assert_eq!(healthy.scalars.lock().expect("lock").len(), 1);
        // Two 4x4 tiles side by side with 2px padding.
        assert_eq!(
            healthy.images.lock().expect("lock").clone(),
            vec![("mask/training".to_string(), 14, 8, 1)]
        );
    }

    #[test]
    fn unsupported_channel_counts_are_skipped() {
        let sink = RecordingSink::default();
        let mut logger = Logger::new(vec![Box::new(sink.clone())]);
        let device = Default::default();
        logger.log_images(vec![(
            "features",
            Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device),
        )]);
        assert!(sink.images.lock().expect("lock").is_empty());
    }
}
