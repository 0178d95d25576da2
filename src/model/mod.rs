//! Networks, data pipeline and the adversarial training loop.
//!
//! The loop only sees the three capabilities below; the concrete architectures in
//! [`architecture`] and [`perceptual`] are one implementation of them.

pub mod architecture;
pub mod data;
pub mod perceptual;
pub mod placement;
pub mod training;

use burn::prelude::*;

/// The two outputs of a two-stage inpainting generator.
#[derive(Debug, Clone)]
pub struct StageOutputs<B: Backend> {
    /// First-pass prediction, `[batch, 3, H, W]` in [-1, 1].
    pub coarse: Tensor<B, 4>,
    /// Second-pass prediction, conditioned on the coarse result.
    pub refined: Tensor<B, 4>,
}

/// Predicts the masked region of an image batch in two passes.
pub trait InpaintGenerator<B: Backend>: Module<B> {
    fn forward(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> StageOutputs<B>;
}

/// Scores images conditioned on their mask; returns a spatial score map `[batch, 1, h, w]`.
pub trait MaskedDiscriminator<B: Backend>: Module<B> {
    fn forward(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Fixed feature extractor used for the perceptual loss.
pub trait FeatureExtractor<B: Backend>: Module<B> {
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}
