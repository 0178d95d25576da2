use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use burn::{
    data::dataloader::DataLoaderBuilder,
    data::dataset::Dataset,
    module::AutodiffModule,
    nn::loss::{MseLoss, Reduction::Mean},
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::ElementConversion,
    tensor::backend::AutodiffBackend,
};
use tracing::{info, warn};

use crate::assembly::{Networks, assemble_networks, assemble_optimizers};
use crate::checkpoint::{CheckpointManager, TrainingState, encode_module, encode_optimizer};
use crate::config::{GanType, LrSchedule, TrainingConfig, is_due};
use crate::error::TrainError;
use crate::logger::Logger;
use crate::model::data::{
    BatchResult, BatchStream, InpaintBatch, InpaintBatcher, InpaintDataset, InpaintItem,
    LoaderStream,
};
use crate::model::placement::Placement;
use crate::model::{FeatureExtractor, InpaintGenerator, MaskedDiscriminator};
use crate::utils::{normalize_imagenet, to_unit_range};

/// Keep `image` where `mask` is 0 and take `stage` where it is 1.
pub fn blend<B: Backend>(
    image: Tensor<B, 4>,
    stage: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let mask = mask.expand(image.dims());
    let keep = mask.clone().neg().add_scalar(1.0);
    image * keep + stage * mask
}

/// Loss minimized by the discriminator, given its scores on real and generated images.
pub fn discriminator_loss<B: Backend>(
    kind: GanType,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    match kind {
        GanType::Wgan => fake.mean() - real.mean(),
        GanType::Lsgan => {
            let mse = MseLoss::new();
            let fake_loss = mse.forward(fake.clone(), fake.zeros_like(), Mean);
            let real_loss = mse.forward(real.clone(), real.ones_like(), Mean);
            (fake_loss + real_loss).mul_scalar(0.5)
        }
    }
}

/// Adversarial term of the generator loss, given the discriminator's scores on its output.
pub fn adversarial_loss<B: Backend>(kind: GanType, fake: Tensor<B, 4>) -> Tensor<B, 1> {
    match kind {
        GanType::Wgan => fake.mean().neg(),
        GanType::Lsgan => MseLoss::new().forward(fake.clone(), fake.ones_like(), Mean),
    }
}

/// Mean absolute error.
pub fn l1<B: Backend>(prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    (prediction - target).abs().mean()
}

/// Map a [-1, 1] batch to the input statistics of the perceptual network.
pub fn perceptual_input<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    normalize_imagenet(to_unit_range(images))
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

/// Loss values of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    pub first_l1: f64,
    pub second_l1: f64,
    pub perceptual: f64,
    pub gan: f64,
    pub discriminator: f64,
    /// The generator objective that was backpropagated.
    pub total: f64,
}

/// What one iteration produced, detached from the graph.
pub struct StepOutput<B: Backend> {
    pub losses: LossTerms,
    pub image: Tensor<B, 4>,
    pub mask: Tensor<B, 4>,
    pub coarse: Tensor<B, 4>,
    pub refined: Tensor<B, 4>,
}

pub struct Trainer<B: AutodiffBackend, G, D, P, OG, OD> {
    config: TrainingConfig,
    networks: Networks<B, G, D, P>,
    optim_g: OG,
    optim_d: OD,
    logger: Logger,
    checkpoints: CheckpointManager,
    schedule_g: LrSchedule,
    schedule_d: LrSchedule,
    lr_g: f64,
    lr_d: f64,
    epoch: usize,
    iteration: usize,
    last_loss: f64,
    stop: Arc<AtomicBool>,
}

impl<B, G, D, P, OG, OD> Trainer<B, G, D, P, OG, OD>
where
    B: AutodiffBackend,
    G: InpaintGenerator<B> + AutodiffModule<B>,
    D: MaskedDiscriminator<B> + AutodiffModule<B>,
    P: FeatureExtractor<B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
{
    /// A trainer positioned at the start of a run, or where `resume` left off.
    pub fn new(
        config: TrainingConfig,
        networks: Networks<B, G, D, P>,
        optim_g: OG,
        optim_d: OD,
        logger: Logger,
        checkpoints: CheckpointManager,
        resume: Option<&TrainingState>,
    ) -> Self {
        let (epoch, iteration, last_loss) = resume
            .map(|state| (state.epoch, state.iteration, state.last_loss))
            .unwrap_or_default();
        let schedule_g = config.generator_schedule();
        let schedule_d = config.discriminator_schedule();

        Self {
            lr_g: schedule_g.at(epoch),
            lr_d: schedule_d.at(epoch),
            schedule_g,
            schedule_d,
            config,
            networks,
            optim_g,
            optim_d,
            logger,
            checkpoints,
            epoch,
            iteration,
            last_loss,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Finish the current batch, checkpoint and return once `stop` is set.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.lr_g, self.lr_d)
    }

    pub fn networks(&self) -> &Networks<B, G, D, P> {
        &self.networks
    }

    /// One discriminator update followed by one generator update.
    pub fn step(&mut self, batch: InpaintBatch<B>) -> Result<StepOutput<B>, TrainError> {
        batch.validate()?;
        let InpaintBatch { images, masks } = batch.to_device(self.networks.placement.primary());
        let kind = self.config.gan_type;

        // Discriminator: scores on the detached fake and on the real image.
        let stages = self.networks.generate(images.clone(), masks.clone());
        let coarse = blend(images.clone(), stages.coarse, masks.clone());
        let refined = blend(images.clone(), stages.refined, masks.clone());

        let fake_scores = self.networks.score(refined.clone().detach(), masks.clone());
        let real_scores = self.networks.score(images.clone(), masks.clone());
        let loss_d = discriminator_loss(kind, real_scores, fake_scores);

        let grads = loss_d.backward();
        let grads = GradientsParams::from_grads(grads, &self.networks.discriminator);
        self.networks.discriminator = self
            .optim_d
            .step(self.lr_d, self.networks.discriminator.clone(), grads);

        // Generator: reconstruction, adversarial and perceptual terms.
        let first_l1 = l1(coarse.clone(), images.clone());
        let second_l1 = l1(refined.clone(), images.clone());
        let gan = adversarial_loss(kind, self.networks.score(refined.clone(), masks.clone()));

        let real_features = self.networks.features(perceptual_input(images.clone()));
        let fake_features = self.networks.features(perceptual_input(refined.clone()));
        let perceptual = l1(fake_features, real_features.detach());

        let loss = first_l1.clone()
            + second_l1.clone()
            + perceptual.clone().mul_scalar(self.config.perceptual_param)
            + gan.clone().mul_scalar(self.config.gan_param);

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.networks.generator);
        self.networks.generator = self
            .optim_g
            .step(self.lr_g, self.networks.generator.clone(), grads);

        self.iteration += 1;

        let losses = LossTerms {
            first_l1: scalar(&first_l1),
            second_l1: scalar(&second_l1),
            perceptual: scalar(&perceptual),
            gan: scalar(&gan),
            discriminator: scalar(&loss_d),
            total: scalar(&loss),
        };
        self.last_loss = losses.total;

        Ok(StepOutput {
            losses,
            image: images,
            mask: masks,
            coarse: coarse.detach(),
            refined: refined.detach(),
        })
    }

    /// Train from the current epoch to `config.epochs`.
    pub fn fit<S: BatchStream<B>>(&mut self, stream: &S) -> Result<(), TrainError> {
        let num_batches = stream.num_batches();
        let epochs = self.config.epochs;
        info!(
            start_epoch = self.epoch,
            iteration = self.iteration,
            epochs,
            batches = num_batches,
            gan_type = ?self.config.gan_type,
            "training"
        );

        let mut prev_time = Instant::now();
        for epoch in self.epoch..epochs {
            self.epoch = epoch;
            for (batch_idx, batch) in stream.batches().enumerate() {
                let out = self.step(batch?)?;
                self.logger.begin_iteration(self.iteration);

                let remaining = (epochs * num_batches).saturating_sub(self.iteration) as u32;
                let time_left = prev_time.elapsed() * remaining;
                prev_time = Instant::now();

                if is_due(self.config.log_every, self.iteration) {
                    self.report(&out, batch_idx, num_batches, time_left);
                }
                if is_due(self.config.checkpoint_every, self.iteration) {
                    self.checkpoint()?;
                }
                if self.stop.load(Ordering::SeqCst) {
                    info!(iteration = self.iteration, "stop requested");
                    return self.checkpoint();
                }
            }
            self.end_epoch(epoch);
        }

        self.checkpoint()
    }

    fn report(
        &mut self,
        out: &StepOutput<B>,
        batch_idx: usize,
        num_batches: usize,
        time_left: Duration,
    ) {
        let losses = out.losses;
        self.logger.log_images(vec![
            ("image/training", out.image.clone()),
            ("mask/training", out.mask.clone()),
            ("image/first iteration", out.coarse.clone()),
            ("image/second iteration", out.refined.clone()),
        ]);
        self.logger.log_scalars(&[
            ("Epoch", (self.epoch + 1) as f64),
            ("Iteration", self.iteration as f64),
            ("loss/first Mask L1 Loss", losses.first_l1),
            ("loss/second Mask L1 Loss", losses.second_l1),
            ("gan/D Loss", losses.discriminator),
            ("gan/G Loss", losses.gan),
            ("Perceptual Loss", losses.perceptual),
        ]);

        info!(
            "[Epoch {}/{}] [Batch {}/{}] iteration {}",
            self.epoch + 1,
            self.config.epochs,
            batch_idx,
            num_batches,
            self.iteration
        );
        info!(
            "[D Loss: {:.5}] [G Loss: {:.5}] [Perceptual Loss: {:.5}] time_left: {}",
            losses.discriminator,
            losses.gan,
            losses.perceptual,
            format_duration(time_left)
        );
    }

    /// Apply the staircase decay for the epoch that starts next.
    fn end_epoch(&mut self, epoch: usize) {
        self.epoch = epoch + 1;
        let lr_g = self.schedule_g.at(self.epoch);
        let lr_d = self.schedule_d.at(self.epoch);
        if lr_g != self.lr_g || lr_d != self.lr_d {
            info!(epoch = self.epoch, lr_g, lr_d, "learning rate decreased");
        }
        self.lr_g = lr_g;
        self.lr_d = lr_d;
    }

    /// Snapshot of the networks, optimizers and counters.
    pub fn state(&self) -> Result<TrainingState, TrainError> {
        Ok(TrainingState {
            epoch: self.epoch,
            iteration: self.iteration,
            last_loss: self.last_loss,
            generator_params: self.networks.generator.num_params(),
            discriminator_params: self.networks.discriminator.num_params(),
            generator: encode_module::<B, G>(&self.networks.generator, "generator")?,
            discriminator: encode_module::<B, D>(&self.networks.discriminator, "discriminator")?,
            optimizer_g: encode_optimizer::<B, G, OG>(&self.optim_g, "optimizer_g")?,
            optimizer_d: encode_optimizer::<B, D, OD>(&self.optim_d, "optimizer_d")?,
        })
    }

    pub fn checkpoint(&self) -> Result<(), TrainError> {
        self.checkpoints.save::<B>(&self.state()?)
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Train with the configured networks and data on `devices`, writing everything to `run_dir`.
pub fn train<B: AutodiffBackend>(
    run_dir: &Path,
    config: TrainingConfig,
    devices: Vec<B::Device>,
    stop: Arc<AtomicBool>,
) -> Result<(), TrainError> {
    config.validate()?;
    std::fs::create_dir_all(run_dir)?;
    config.save(run_dir.join("config.json"))?;

    B::seed(config.seed);
    let placement = Placement::<B>::new(devices, config.multi_gpu)?;
    if config.cudnn_benchmark {
        info!("cudnn_benchmark is set; kernel autotuning is handled by the backend");
    }

    let checkpoints = CheckpointManager::from_config(&config, run_dir)?;
    let resume = checkpoints.restore::<B>(config.restore_id(), placement.primary());

    let (networks, resume) = match assemble_networks(&config, placement.clone(), resume.as_ref()) {
        Ok(networks) => (networks, resume),
        Err(TrainError::Restore(err)) => {
            warn!(error = %err, "checkpoint does not fit the networks, starting from scratch");
            (assemble_networks(&config, placement, None)?, None)
        }
        Err(err) => return Err(err),
    };
    let (networks, resume, (optim_g, optim_d)) =
        match assemble_optimizers(&config, &networks, resume.as_ref()) {
            Ok(optimizers) => (networks, resume, optimizers),
            Err(TrainError::Restore(err)) => {
                warn!(error = %err, "optimizer state does not fit, starting from scratch");
                let networks = assemble_networks(&config, networks.placement.clone(), None)?;
                let optimizers = assemble_optimizers(&config, &networks, None)?;
                (networks, None, optimizers)
            }
            Err(err) => return Err(err),
        };

    let dataset = InpaintDataset::new(&config.baseroot)?;
    info!(images = dataset.len(), root = %config.baseroot, "training set");
    let batcher = InpaintBatcher::new(config.image_size, config.mask.clone(), config.seed);
    let loader = DataLoaderBuilder::<B, InpaintItem, BatchResult<B>>::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset);
    let stream = LoaderStream::new(loader, config.batch_size);

    let logger = Logger::from_config(&config, run_dir);
    let mut trainer = Trainer::new(
        config,
        networks,
        optim_g,
        optim_d,
        logger,
        checkpoints,
        resume.as_ref(),
    )
    .with_stop_signal(stop);
    trainer.fit(&stream)
}
