use burn::prelude::*;
use tracing::{info, warn};

use crate::error::TrainError;

/// Where the networks live and how a forward pass is spread over devices.
///
/// With `Replicated`, every call scatters the batch along dim 0, runs one replica per
/// device and gathers the outputs back on the first (primary) device. Replicas are moved
/// with `to_device`, so gradients flow back into the primary parameters.
#[derive(Debug, Clone)]
pub enum Placement<B: Backend> {
    Single(B::Device),
    Replicated(Vec<B::Device>),
}

impl<B: Backend> Placement<B> {
    pub fn new(devices: Vec<B::Device>, multi_gpu: bool) -> Result<Self, TrainError> {
        let mut devices = devices;
        match devices.len() {
            0 => Err(TrainError::Device("no compute device available".into())),
            1 => {
                if multi_gpu {
                    warn!("multi_gpu requested with a single device, running unreplicated");
                }
                Ok(Self::Single(devices.remove(0)))
            }
            n if multi_gpu => {
                info!(devices = n, "replicating forward passes");
                Ok(Self::Replicated(devices))
            }
            _ => Ok(Self::Single(devices.remove(0))),
        }
    }

    pub fn primary(&self) -> &B::Device {
        match self {
            Self::Single(device) => device,
            Self::Replicated(devices) => &devices[0],
        }
    }

    pub fn num_devices(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Replicated(devices) => devices.len(),
        }
    }

    /// Move a freshly built or restored module onto the primary device.
    pub fn place<M: Module<B>>(&self, module: M) -> M {
        module.fork(self.primary())
    }

    /// Run `forward` on `module`, sharding the batch when replicated.
    pub fn dispatch<M, F, const N: usize, const K: usize>(
        &self,
        module: &M,
        inputs: [Tensor<B, 4>; N],
        forward: F,
    ) -> [Tensor<B, 4>; K]
    where
        M: Module<B>,
        F: Fn(&M, [Tensor<B, 4>; N]) -> [Tensor<B, 4>; K],
    {
        let devices = match self {
            Self::Single(_) => return forward(module, inputs),
            Self::Replicated(devices) => devices,
        };

        let batch = inputs.first().map_or(0, |input| input.dims()[0]);
        let shards = devices.len().min(batch);
        if shards <= 1 {
            return forward(module, inputs);
        }

        let chunks = inputs.map(|input| input.chunk(shards, 0));
        let used = chunks.iter().map(Vec::len).min().unwrap_or(0);
        let primary = &devices[0];

        let mut gathered: [Vec<Tensor<B, 4>>; K] =
            std::array::from_fn(|_| Vec::with_capacity(used));
        for (shard, device) in devices.iter().take(used).enumerate() {
            let replica = module.clone().to_device(device);
            let shard_inputs = std::array::from_fn(|i| chunks[i][shard].clone().to_device(device));
            for (slot, output) in gathered.iter_mut().zip(forward(&replica, shard_inputs)) {
                slot.push(output.to_device(primary));
            }
        }

        gathered.map(|parts| Tensor::cat(parts, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::conv::{Conv2d, Conv2dConfig};
    use burn::optim::GradientsParams;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn run(
        placement: &Placement<TestBackend>,
        conv: &Conv2d<TestBackend>,
        input: Tensor<TestBackend, 4>,
    ) -> Tensor<TestBackend, 4> {
        let [out] = placement.dispatch(conv, [input], |conv, [x]| [conv.forward(x)]);
        out
    }

    #[test]
    fn replicated_dispatch_matches_single_device() {
        let device = Default::default();
        let conv = Conv2dConfig::new([3, 2], [1, 1]).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [3, 3, 4, 4],
            burn::tensor::Distribution::Default,
            &device,
        );

        let single = Placement::<TestBackend>::new(vec![device], false).expect("placement");
        let replicated =
            Placement::<TestBackend>::new(vec![device, device], true).expect("placement");
        assert!(matches!(replicated, Placement::Replicated(_)));

        let expected = run(&single, &conv, input.clone());
        let actual = run(&replicated, &conv, input);
        assert_eq!(actual.dims(), [3, 2, 4, 4]);
        let expected = expected.into_data().to_vec::<f32>().expect("f32 data");
        let actual = actual.into_data().to_vec::<f32>().expect("f32 data");
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-5, "{a} != {b}");
        }
    }

    #[test]
    fn gradients_reach_the_primary_parameters() {
        let device = Default::default();
        let conv = Conv2dConfig::new([3, 2], [1, 1]).init::<TestBackend>(&device);
        let replicated =
            Placement::<TestBackend>::new(vec![device, device], true).expect("placement");

        let input = Tensor::<TestBackend, 4>::ones([4, 3, 2, 2], &device);
        let grads = run(&replicated, &conv, input).sum().backward();
        let grads = GradientsParams::from_grads(grads, &conv);
        assert!(!grads.is_empty());
    }

    #[test]
    fn no_devices_is_a_device_error() {
        let result = Placement::<TestBackend>::new(Vec::new(), true);
        assert!(matches!(result, Err(TrainError::Device(_))));
    }
}
