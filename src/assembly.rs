//! Building the three networks and the two optimizers, fresh or from a snapshot.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{Adam, adaptor::OptimizerAdaptor};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::checkpoint::{TrainingState, decode_module, decode_optimizer};
use crate::config::TrainingConfig;
use crate::error::{RestoreError, TrainError};
use crate::model::architecture::{PatchDiscriminator, TwoStageGenerator};
use crate::model::perceptual::PerceptualNet;
use crate::model::placement::Placement;
use crate::model::{FeatureExtractor, InpaintGenerator, MaskedDiscriminator, StageOutputs};

/// The generator, the discriminator and the frozen feature extractor, placed on devices.
///
/// Every forward pass goes through the placement, so replication stays invisible to callers.
pub struct Networks<B: Backend, G, D, P> {
    pub generator: G,
    pub discriminator: D,
    pub perceptual: P,
    pub placement: Placement<B>,
}

impl<B, G, D, P> Networks<B, G, D, P>
where
    B: Backend,
    G: InpaintGenerator<B>,
    D: MaskedDiscriminator<B>,
    P: FeatureExtractor<B>,
{
    pub fn generate(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> StageOutputs<B> {
        let [coarse, refined] = self.placement.dispatch(
            &self.generator,
            [image, mask],
            |generator, [image, mask]| {
                let out = generator.forward(image, mask);
                [out.coarse, out.refined]
            },
        );
        StageOutputs { coarse, refined }
    }

    pub fn score(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let [scores] = self.placement.dispatch(
            &self.discriminator,
            [image, mask],
            |discriminator, [image, mask]| [discriminator.forward(image, mask)],
        );
        scores
    }

    pub fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let [features] = self
            .placement
            .dispatch(&self.perceptual, [image], |net, [image]| [net.forward(image)]);
        features
    }
}

pub type InpaintNetworks<B> =
    Networks<B, TwoStageGenerator<B>, PatchDiscriminator<B>, PerceptualNet<B>>;

/// Adam bound to the parameters of one module.
pub type AdamOptimizer<M, B> = OptimizerAdaptor<Adam, M, B>;

/// Build the networks from `config`, load `checkpoint` weights if given, then place them.
pub fn assemble_networks<B: Backend>(
    config: &TrainingConfig,
    placement: Placement<B>,
    checkpoint: Option<&TrainingState>,
) -> Result<InpaintNetworks<B>, TrainError> {
    let device = placement.primary().clone();
    let mut generator = config.generator.init::<B>(&device);
    let mut discriminator = config.discriminator.init::<B>(&device);
    let perceptual = config
        .perceptual
        .init_pretrained::<B>(
            config.perceptual_weights.as_deref().map(Path::new),
            config.seed,
            &device,
        )?;

    if let Some(state) = checkpoint {
        generator = decode_module(
            generator,
            &state.generator,
            state.generator_params,
            "generator",
            &device,
        )?;
        discriminator = decode_module(
            discriminator,
            &state.discriminator,
            state.discriminator_params,
            "discriminator",
            &device,
        )?;
    }

    info!(
        generator = generator.num_params(),
        discriminator = discriminator.num_params(),
        perceptual = perceptual.num_params(),
        devices = placement.num_devices(),
        "networks ready"
    );

    Ok(Networks {
        generator: placement.place(generator),
        discriminator: placement.place(discriminator),
        perceptual: placement.place(perceptual),
        placement,
    })
}

/// One Adam per trainable network, with state restored from `checkpoint` if given.
pub fn assemble_optimizers<B, G, D, P>(
    config: &TrainingConfig,
    networks: &Networks<B, G, D, P>,
    checkpoint: Option<&TrainingState>,
) -> Result<(AdamOptimizer<G, B>, AdamOptimizer<D, B>), TrainError>
where
    B: AutodiffBackend,
    G: AutodiffModule<B>,
    D: AutodiffModule<B>,
{
    let adam = config.adam();
    let mut optim_g = adam.init::<B, G>();
    let mut optim_d = adam.init::<B, D>();

    if let Some(state) = checkpoint {
        let device = networks.placement.primary();
        check_params("optimizer_g", networks.generator.num_params(), state.generator_params)?;
        check_params(
            "optimizer_d",
            networks.discriminator.num_params(),
            state.discriminator_params,
        )?;
        optim_g = decode_optimizer::<B, G, _>(optim_g, &state.optimizer_g, "optimizer_g", device)?;
        optim_d = decode_optimizer::<B, D, _>(optim_d, &state.optimizer_d, "optimizer_d", device)?;
    }

    Ok((optim_g, optim_d))
}

fn check_params(network: &'static str, expected: usize, found: usize) -> Result<(), RestoreError> {
    if expected == found {
        Ok(())
    } else {
        Err(RestoreError::ParamMismatch {
            network,
            expected,
            found,
        })
    }
}
