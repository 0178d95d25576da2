use burn::{
    nn::{
        LeakyRelu, LeakyReluConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    tensor::activation::{leaky_relu, sigmoid, tanh},
};

use crate::model::{InpaintGenerator, MaskedDiscriminator, StageOutputs};

const NEGATIVE_SLOPE: f64 = 0.2;

/// Convolution whose output is modulated by a learned soft gate.
#[derive(Module, Debug)]
pub struct GatedConv2d<B: Backend> {
    feature: Conv2d<B>,
    gate: Conv2d<B>,
}

/// 2x upsampling counterpart of [`GatedConv2d`].
#[derive(Module, Debug)]
pub struct GatedDeconv2d<B: Backend> {
    feature: ConvTranspose2d<B>,
    gate: ConvTranspose2d<B>,
}

impl<B: Backend> GatedConv2d<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        let padding = dilation * (kernel - 1) / 2;
        let conv = || {
            Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_dilation([dilation, dilation])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(device)
        };
        Self {
            feature: conv(),
            gate: conv(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = leaky_relu(self.feature.forward(input.clone()), NEGATIVE_SLOPE);
        features * sigmoid(self.gate.forward(input))
    }
}

impl<B: Backend> GatedDeconv2d<B> {
    pub fn new(channels: [usize; 2], device: &B::Device) -> Self {
        let deconv = || {
            ConvTranspose2dConfig::new(channels, [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .init(device)
        };
        Self {
            feature: deconv(),
            gate: deconv(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = leaky_relu(self.feature.forward(input.clone()), NEGATIVE_SLOPE);
        features * sigmoid(self.gate.forward(input))
    }
}

/// Hyperparameters shared by the coarse and the refinement stage.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Channels of the first gated layer; doubled at each downsampling.
    #[config(default = 32)]
    pub base_dim: usize,

    /// Number of stride-2 downsamplings (and matching upsamplings).
    #[config(default = 2)]
    pub depth: usize,

    /// Dilation rates of the bottleneck layers.
    #[config(default = "vec![2, 4, 8, 16]")]
    pub dilations: Vec<usize>,
}

/// Gated encoder/decoder used for one generator pass. Input: masked RGB + mask.
#[derive(Module, Debug)]
pub struct GatedStage<B: Backend> {
    head: GatedConv2d<B>,
    down: Vec<GatedConv2d<B>>,
    middle: Vec<GatedConv2d<B>>,
    up: Vec<GatedDeconv2d<B>>,
    up_refine: Vec<GatedConv2d<B>>,
    out: Conv2d<B>,
}

/// Coarse-to-fine inpainting generator.
#[derive(Module, Debug)]
pub struct TwoStageGenerator<B: Backend> {
    coarse: GatedStage<B>,
    refine: GatedStage<B>,
}

impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TwoStageGenerator<B> {
        TwoStageGenerator {
            coarse: self.init_stage(device),
            refine: self.init_stage(device),
        }
    }

    fn init_stage<B: Backend>(&self, device: &B::Device) -> GatedStage<B> {
        let base = self.base_dim;
        let head = GatedConv2d::new([4, base], 5, 1, 1, device);

        let mut down = Vec::with_capacity(2 * self.depth);
        for level in 0..self.depth {
            let channels = base << level;
            down.push(GatedConv2d::new([channels, channels * 2], 3, 2, 1, device));
            down.push(GatedConv2d::new([channels * 2, channels * 2], 3, 1, 1, device));
        }

        let top = base << self.depth;
        let middle = self
            .dilations
            .iter()
            .map(|&dilation| GatedConv2d::new([top, top], 3, 1, dilation, device))
            .collect();

        let mut up = Vec::with_capacity(self.depth);
        let mut up_refine = Vec::with_capacity(self.depth);
        for level in (0..self.depth).rev() {
            let channels = base << (level + 1);
            up.push(GatedDeconv2d::new([channels, channels / 2], device));
            up_refine.push(GatedConv2d::new([channels / 2, channels / 2], 3, 1, 1, device));
        }

        let out = Conv2dConfig::new([base, 3], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        GatedStage {
            head,
            down,
            middle,
            up,
            up_refine,
            out,
        }
    }
}

impl<B: Backend> GatedStage<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.head.forward(input);
        for layer in &self.down {
            x = layer.forward(x);
        }
        for layer in &self.middle {
            x = layer.forward(x);
        }
        for (up, refine) in self.up.iter().zip(&self.up_refine) {
            x = refine.forward(up.forward(x));
        }
        tanh(self.out.forward(x))
    }
}

impl<B: Backend> InpaintGenerator<B> for TwoStageGenerator<B> {
    fn forward(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> StageOutputs<B> {
        let mask_rgb = mask.clone().expand(image.dims());
        let keep = mask_rgb.clone().neg().add_scalar(1.0);

        // Holes are filled with 1 so the first pass sees them as a flat colour.
        let masked = image.clone() * keep.clone() + mask_rgb.clone();
        let coarse = self
            .coarse
            .forward(Tensor::cat(vec![masked, mask.clone()], 1));

        let blended = image * keep + coarse.clone() * mask_rgb;
        let refined = self.refine.forward(Tensor::cat(vec![blended, mask], 1));

        StageOutputs { coarse, refined }
    }
}

/// Patch discriminator conditioned on the mask.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    #[config(default = 64)]
    pub base_dim: usize,

    /// Stride-2 layers; a 256px input with 5 of them yields an 8x8 score map.
    #[config(default = 5)]
    pub num_downsamples: usize,

    #[config(default = 0.2)]
    pub leaky_relu_slope: f64,
}

#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    head: Conv2d<B>,
    down: Vec<Conv2d<B>>,
    score: Conv2d<B>,
    activation: LeakyRelu,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchDiscriminator<B> {
        let head = Conv2dConfig::new([4, self.base_dim], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let widest = self.base_dim * 4;
        let mut channels = self.base_dim;
        let mut down = Vec::with_capacity(self.num_downsamples);
        for _ in 0..self.num_downsamples {
            let next = (channels * 2).min(widest);
            down.push(
                Conv2dConfig::new([channels, next], [4, 4])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            channels = next;
        }

        let score = Conv2dConfig::new([channels, 1], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        PatchDiscriminator {
            head,
            down,
            score,
            activation: LeakyReluConfig::new()
                .with_negative_slope(self.leaky_relu_slope)
                .init(),
        }
    }
}

impl<B: Backend> MaskedDiscriminator<B> for PatchDiscriminator<B> {
    fn forward(&self, image: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self
            .activation
            .forward(self.head.forward(Tensor::cat(vec![image, mask], 1)));
        for layer in &self.down {
            x = self.activation.forward(layer.forward(x));
        }
        self.score.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn generator_keeps_the_input_resolution() {
        let device = Default::default();
        let generator = GeneratorConfig::new()
            .with_base_dim(4)
            .with_depth(2)
            .with_dilations(vec![2])
            .init::<TestBackend>(&device);

        let image = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let mask = Tensor::<TestBackend, 4>::ones([2, 1, 16, 16], &device);
        let out = generator.forward(image, mask);

        assert_eq!(out.coarse.dims(), [2, 3, 16, 16]);
        assert_eq!(out.refined.dims(), [2, 3, 16, 16]);
        let max = out.refined.abs().max().into_scalar();
        assert!(max <= 1.0);
    }

    #[test]
    fn discriminator_emits_a_downsampled_score_map() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new()
            .with_base_dim(4)
            .with_num_downsamples(3)
            .init::<TestBackend>(&device);

        let image = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let mask = Tensor::<TestBackend, 4>::zeros([2, 1, 32, 32], &device);
        assert_eq!(discriminator.forward(image, mask).dims(), [2, 1, 4, 4]);
    }
}
