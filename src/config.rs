use burn::config::Config;
use burn::optim::{AdamConfig, decay::WeightDecayConfig};
use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::model::architecture::{DiscriminatorConfig, GeneratorConfig};
use crate::model::data::MaskConfig;
use crate::model::perceptual::PerceptualNetConfig;

/// Adversarial objective used for the discriminator and the generator's GAN term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GanType {
    /// Wasserstein-style critic, unbounded scores.
    Wgan,
    /// Least-squares GAN against target maps of ones and zeros.
    Lsgan,
}

/// Resolved hyperparameters and runtime flags for one training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Directory holding the training images.
    pub baseroot: String,

    #[config(default = "GeneratorConfig::new()")]
    pub generator: GeneratorConfig,

    #[config(default = "DiscriminatorConfig::new()")]
    pub discriminator: DiscriminatorConfig,

    #[config(default = "PerceptualNetConfig::new()")]
    pub perceptual: PerceptualNetConfig,

    #[config(default = "MaskConfig::new()")]
    pub mask: MaskConfig,

    #[config(default = "GanType::Wgan")]
    pub gan_type: GanType,

    #[config(default = 1e-4)]
    pub lr_g: f64,

    #[config(default = 4e-4)]
    pub lr_d: f64,

    #[config(default = 0.5)]
    pub b1: f64,

    #[config(default = 0.999)]
    pub b2: f64,

    #[config(default = 0.0)]
    pub weight_decay: f64,

    #[config(default = 0.5)]
    pub lr_decrease_factor: f64,

    #[config(default = 10)]
    pub lr_decrease_epoch: usize,

    #[config(default = 10.0)]
    pub perceptual_param: f64,

    #[config(default = 1.0)]
    pub gan_param: f64,

    #[config(default = 4)]
    pub batch_size: usize,

    #[config(default = 40)]
    pub epochs: usize,

    #[config(default = 8)]
    pub num_workers: usize,

    #[config(default = 256)]
    pub image_size: usize,

    #[config(default = 100)]
    pub log_every: usize,

    #[config(default = 1000)]
    pub checkpoint_every: usize,

    #[config(default = false)]
    pub multi_gpu: bool,

    /// Device ordinals; the first one is the primary device.
    #[config(default = "vec![0]")]
    pub devices: Vec<usize>,

    #[config(default = true)]
    pub cudnn_benchmark: bool,

    /// Snapshot id to resume from (`latest` or an iteration number).
    pub restore: Option<String>,

    /// Where to resume from: a local file, a local directory or an http(s) URL.
    pub wandb_runpath: Option<String>,

    /// Pretrained perceptual weights (`.pth` from torchvision or a burn `.mpk` record).
    pub perceptual_weights: Option<String>,

    pub dashboard_url: Option<String>,

    /// Remote store every `checkpoint_*` blob is mirrored to.
    pub mirror_url: Option<String>,

    #[config(default = 2)]
    pub checkpoint_retries: usize,

    #[config(default = 500)]
    pub checkpoint_retry_backoff_ms: u64,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject settings the networks or the loop cannot run with.
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if self.devices.is_empty() {
            return Err(TrainError::Device("no compute device configured".into()));
        }
        let generator_stride = 1usize << self.generator.depth;
        if self.image_size % generator_stride != 0 {
            return Err(TrainError::Config(format!(
                "image_size {} is not divisible by the generator stride {generator_stride}",
                self.image_size
            )));
        }
        let discriminator_stride = 1usize << self.discriminator.num_downsamples;
        if self.image_size < discriminator_stride {
            return Err(TrainError::Config(format!(
                "image_size {} is smaller than the discriminator stride {discriminator_stride}",
                self.image_size
            )));
        }
        Ok(())
    }

    pub fn generator_schedule(&self) -> LrSchedule {
        LrSchedule::new(self.lr_g, self.lr_decrease_factor, self.lr_decrease_epoch)
    }

    pub fn discriminator_schedule(&self) -> LrSchedule {
        LrSchedule::new(self.lr_d, self.lr_decrease_factor, self.lr_decrease_epoch)
    }

    /// Adam settings shared by both players; the learning rate is supplied per step.
    pub fn adam(&self) -> AdamConfig {
        let adam = AdamConfig::new()
            .with_beta_1(self.b1 as f32)
            .with_beta_2(self.b2 as f32);
        if self.weight_decay > 0.0 {
            adam.with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)))
        } else {
            adam
        }
    }

    /// The requested snapshot id, if resuming was asked for.
    pub fn restore_id(&self) -> Option<&str> {
        self.restore
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Staircase decay: `base * factor ^ (epoch / every)`, recomputed from the base rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base: f64,
    pub factor: f64,
    pub every: usize,
}

impl LrSchedule {
    pub fn new(base: f64, factor: f64, every: usize) -> Self {
        Self {
            base,
            factor,
            every,
        }
    }

    pub fn at(&self, epoch: usize) -> f64 {
        if self.every == 0 {
            return self.base;
        }
        let steps = (epoch / self.every) as i32;
        self.base * self.factor.powi(steps)
    }
}

/// True when a periodic event is due on `iteration` (1-based, counted after the increment).
///
/// Fires on the first iteration and every `every` iterations after; `every == 0` never fires.
pub fn is_due(every: usize, iteration: usize) -> bool {
    every > 0 && iteration > 0 && (iteration - 1) % every == 0
}
