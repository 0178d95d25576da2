use std::path::Path;

use burn::{
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    module::Param,
    prelude::*,
    record::{CompactRecorder, FullPrecisionSettings, Recorder},
    tensor::{TensorData, activation::relu},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::error::TrainError;
use crate::model::FeatureExtractor;

/// Channel multipliers of the VGG16 convolutions up to `relu3_3`.
const STAGE_WIDTHS: [usize; 7] = [1, 1, 2, 2, 4, 4, 4];
/// A 2x2 max-pool follows these convolutions.
const POOL_AFTER: [usize; 2] = [1, 3];
/// Indices of the matching layers inside torchvision's `vgg16().features`.
const TORCHVISION_INDICES: [usize; 7] = [0, 2, 5, 7, 10, 12, 14];

/// VGG16 feature stack truncated at `relu3_3`.
#[derive(Config, Debug)]
pub struct PerceptualNetConfig {
    /// 64 matches the pretrained VGG16 weights.
    #[config(default = 64)]
    pub base_dim: usize,
}

#[derive(Module, Debug)]
pub struct PerceptualNet<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl PerceptualNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PerceptualNet<B> {
        let mut in_channels = 3;
        let convs = STAGE_WIDTHS
            .iter()
            .map(|&width| {
                let out_channels = width * self.base_dim;
                let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device);
                in_channels = out_channels;
                conv
            })
            .collect();

        PerceptualNet {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Same layout as [`init`](Self::init), with weights drawn from `seed` alone.
    ///
    /// Kaiming-uniform kernels and zero biases. Snapshots do not store this network;
    /// resumed runs rebuild it from the same seed.
    pub fn init_seeded<B: Backend>(&self, seed: u64, device: &B::Device) -> PerceptualNet<B> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut net = self.init(device);
        for conv in net.convs.iter_mut() {
            let dims = conv.weight.val().dims();
            let fan_in = (dims[1] * dims[2] * dims[3]) as f32;
            let bound = (6.0 / fan_in).sqrt();
            let values: Vec<f32> = (0..dims.iter().product::<usize>())
                .map(|_| rng.random_range(-bound..bound))
                .collect();
            let weight = Tensor::from_data(TensorData::new(values, dims.to_vec()), device);
            conv.weight = Param::from_tensor(weight);
            conv.bias = conv
                .bias
                .take()
                .map(|bias| Param::from_tensor(bias.val().zeros_like()));
        }
        net
    }

    /// Build the network, load pretrained weights if a path is given, and freeze it.
    ///
    /// `.pth`/`.pt` files are read as torchvision `vgg16` state dicts; anything else as a
    /// burn record written by `CompactRecorder`. Without weights the network is seeded
    /// from `seed`.
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: Option<&Path>,
        seed: u64,
        device: &B::Device,
    ) -> Result<PerceptualNet<B>, TrainError> {
        let net = match weights {
            Some(path) => {
                let net = self.init(device);
                let record = load_record::<B>(path, device).map_err(|message| {
                    TrainError::Weights {
                        path: path.to_path_buf(),
                        message,
                    }
                })?;
                info!(path = %path.display(), "loaded perceptual weights");
                net.load_record(record)
            }
            None => {
                warn!(
                    seed,
                    "no perceptual weights configured, the perceptual loss uses random features"
                );
                self.init_seeded(seed, device)
            }
        };
        Ok(net.no_grad())
    }
}

fn load_record<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<PerceptualNetRecord<B>, String> {
    let is_torch = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "pth" | "pt"));

    if is_torch {
        let args = TORCHVISION_INDICES.iter().enumerate().fold(
            LoadArgs::new(path.to_path_buf()),
            |args, (conv, layer)| {
                let pattern = format!(r"^features\.{layer}\.(.+)$");
                args.with_key_remap(&pattern, &format!("convs.{conv}.$1"))
            },
        );
        PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|err| err.to_string())
    } else {
        CompactRecorder::new()
            .load(path.to_path_buf(), device)
            .map_err(|err| err.to_string())
    }
}

impl<B: Backend> FeatureExtractor<B> for PerceptualNet<B> {
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = image;
        for (idx, conv) in self.convs.iter().enumerate() {
            x = relu(conv.forward(x));
            if POOL_AFTER.contains(&idx) {
                x = self.pool.forward(x);
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn features_are_quarter_resolution_with_four_times_the_base_width() {
        let device = Default::default();
        let net = PerceptualNetConfig::new()
            .with_base_dim(2)
            .init_pretrained::<TestBackend>(None, 3, &device)
            .expect("random init");
        let out = net.forward(Tensor::zeros([1, 3, 16, 16], &device));
        assert_eq!(out.dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn pretrained_network_is_frozen() {
        let device = Default::default();
        let net = PerceptualNetConfig::new()
            .with_base_dim(2)
            .init_pretrained::<TestBackend>(None, 3, &device)
            .expect("random init");

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device).require_grad();
        let loss = net.forward(input.clone()).sum();
        let grads = loss.backward();

        // Gradients reach the input but no parameter is tracked.
        assert!(input.grad(&grads).is_some());
        let params = burn::optim::GradientsParams::from_grads(grads, &net);
        assert!(params.is_empty());
        assert_eq!(net.valid().num_params(), net.num_params());
    }

    #[test]
    fn missing_weights_file_is_an_error() {
        let device = Default::default();
        let result = PerceptualNetConfig::new()
            .with_base_dim(2)
            .init_pretrained::<TestBackend>(
                Some(Path::new("/nonexistent/vgg16.mpk")),
                3,
                &device,
            );
        assert!(matches!(result, Err(TrainError::Weights { .. })));
    }

    #[test]
    fn unweighted_networks_depend_only_on_the_seed() {
        let device = Default::default();
        let config = PerceptualNetConfig::new().with_base_dim(2);
        let features = |seed| {
            let net = config
                .init_pretrained::<TestBackend>(None, seed, &device)
                .expect("seeded init");
            let input = Tensor::<TestBackend, 1, Int>::arange(0..192, &device)
                .float()
                .div_scalar(192.0)
                .reshape([1, 3, 8, 8]);
            net.forward(input).into_data().to_vec::<f32>().expect("f32")
        };

        assert_eq!(features(42), features(42));
        assert_ne!(features(42), features(43));
    }
}
