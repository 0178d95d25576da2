//! Training snapshots: what is saved, under which keys, and how it comes back.
//!
//! Every snapshot is written twice with identical bytes, as `checkpoint_<iteration>` and
//! `checkpoint_latest`. Restoring never fails the run: a missing or unreadable snapshot is
//! logged and training starts from scratch.

pub mod store;

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::error::{RestoreError, TrainError};
use store::{BlobStore, DirectoryStore, HttpStore, MirroredStore};

pub const KEY_PREFIX: &str = "checkpoint_";
pub const LATEST: &str = "latest";

pub fn checkpoint_key(id: impl Display) -> String {
    format!("{KEY_PREFIX}{id}")
}

type SnapshotRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Everything needed to continue a run. Network and optimizer records are stored as
/// encoded bytes so one blob can be moved between stores as-is.
#[derive(Record, Clone, Debug)]
pub struct TrainingState {
    pub epoch: usize,
    pub iteration: usize,
    pub last_loss: f64,
    pub generator_params: usize,
    pub discriminator_params: usize,
    pub generator: Vec<u8>,
    pub discriminator: Vec<u8>,
    pub optimizer_g: Vec<u8>,
    pub optimizer_d: Vec<u8>,
}

impl TrainingState {
    pub fn to_bytes<B: Backend>(&self) -> Result<Vec<u8>, TrainError> {
        Recorder::<B>::record(&SnapshotRecorder::default(), self.clone(), ()).map_err(|err| {
            TrainError::Encode {
                part: "snapshot",
                message: err.to_string(),
            }
        })
    }

    pub fn from_bytes<B: Backend>(
        bytes: Vec<u8>,
        device: &B::Device,
    ) -> Result<Self, RestoreError> {
        Recorder::<B>::load::<Self>(&SnapshotRecorder::default(), bytes, device).map_err(|err| {
            RestoreError::Decode {
                part: "snapshot",
                message: err.to_string(),
            }
        })
    }
}

pub fn encode_module<B: Backend, M: Module<B>>(
    module: &M,
    part: &'static str,
) -> Result<Vec<u8>, TrainError> {
    Recorder::<B>::record(&SnapshotRecorder::default(), module.clone().into_record(), ())
        .map_err(|err| TrainError::Encode {
            part,
            message: err.to_string(),
        })
}

/// Load saved weights into `module` after checking that parameter counts and shapes agree.
pub fn decode_module<B: Backend, M: Module<B>>(
    module: M,
    bytes: &[u8],
    saved_params: usize,
    network: &'static str,
    device: &B::Device,
) -> Result<M, RestoreError> {
    let expected = module.num_params();
    if expected != saved_params {
        return Err(RestoreError::ParamMismatch {
            network,
            expected,
            found: saved_params,
        });
    }
    let recorder = SnapshotRecorder::default();
    let record = Recorder::<B>::load::<M::Record>(&recorder, bytes.to_vec(), device)
        .map_err(|err| RestoreError::Decode {
            part: network,
            message: err.to_string(),
        })?;

    let shapes = param_shapes(&module);
    let loaded = module.load_record(record);
    for (expected, found) in shapes.into_iter().zip(param_shapes(&loaded)) {
        if expected != found {
            return Err(RestoreError::ShapeMismatch {
                network,
                expected,
                found,
            });
        }
    }
    Ok(loaded)
}

/// Dimensions of every float parameter, in visiting order.
struct ParamShapes(Vec<Vec<usize>>);

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.0.push(tensor.dims().to_vec());
    }
}

fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut shapes = ParamShapes(Vec::new());
    module.visit(&mut shapes);
    shapes.0
}

pub fn encode_optimizer<B, M, O>(optimizer: &O, part: &'static str) -> Result<Vec<u8>, TrainError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(&SnapshotRecorder::default(), optimizer.to_record(), ()).map_err(|err| {
        TrainError::Encode {
            part,
            message: err.to_string(),
        }
    })
}

pub fn decode_optimizer<B, M, O>(
    optimizer: O,
    bytes: &[u8],
    part: &'static str,
    device: &B::Device,
) -> Result<O, RestoreError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let recorder = SnapshotRecorder::default();
    let record = Recorder::<B>::load::<O::Record>(&recorder, bytes.to_vec(), device)
        .map_err(|err| RestoreError::Decode {
            part,
            message: err.to_string(),
        })?;
    Ok(optimizer.load_record(record))
}

/// Writes snapshots to the run's store and reads them back from the restore source.
pub struct CheckpointManager {
    store: Arc<dyn BlobStore>,
    source: Arc<dyn BlobStore>,
    retries: usize,
    backoff: Duration,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn BlobStore>, source: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            source,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// A manager reading and writing the same store.
    pub fn in_store(store: Arc<dyn BlobStore>) -> Self {
        Self::new(store.clone(), store)
    }

    pub fn with_retries(mut self, retries: usize, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Store under `run_dir`, optionally mirrored; restore source from `wandb_runpath`.
    pub fn from_config(config: &TrainingConfig, run_dir: &Path) -> Result<Self, TrainError> {
        let local = DirectoryStore::new(run_dir);
        let store: Arc<dyn BlobStore> = match config.mirror_url.as_deref() {
            Some(url) => {
                let mirror = HttpStore::new(url).map_err(|err| {
                    TrainError::Config(format!("mirror store {url}: {err}"))
                })?;
                Arc::new(MirroredStore::new(Box::new(local), Box::new(mirror)))
            }
            None => Arc::new(local),
        };
        let source = store::resolve_restore_source(config.wandb_runpath.as_deref(), store.clone())
            .map_err(|err| TrainError::Config(format!("restore source: {err}")))?;

        Ok(Self::new(store, source).with_retries(
            config.checkpoint_retries,
            Duration::from_millis(config.checkpoint_retry_backoff_ms),
        ))
    }

    /// Snapshot `id` if one was requested and can be read; `None` otherwise.
    pub fn restore<B: Backend>(
        &self,
        id: Option<&str>,
        device: &B::Device,
    ) -> Option<TrainingState> {
        let id = id?;
        match self.try_restore::<B>(id, device) {
            Ok(state) => {
                info!(
                    id,
                    epoch = state.epoch,
                    iteration = state.iteration,
                    "restored checkpoint"
                );
                Some(state)
            }
            Err(err) => {
                warn!(id, error = %err, "could not restore checkpoint, starting from scratch");
                None
            }
        }
    }

    pub fn try_restore<B: Backend>(
        &self,
        id: &str,
        device: &B::Device,
    ) -> Result<TrainingState, RestoreError> {
        let key = checkpoint_key(id);
        let bytes = self
            .source
            .get(&key)
            .map_err(|source| RestoreError::Fetch { key, source })?;
        TrainingState::from_bytes::<B>(bytes, device)
    }

    /// Write `state` as `checkpoint_<iteration>` and `checkpoint_latest`.
    pub fn save<B: Backend>(&self, state: &TrainingState) -> Result<(), TrainError> {
        let bytes = state.to_bytes::<B>()?;
        for key in [checkpoint_key(state.iteration), checkpoint_key(LATEST)] {
            self.put_with_retry(&key, &bytes)?;
        }
        info!(
            epoch = state.epoch,
            iteration = state.iteration,
            bytes = bytes.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    fn put_with_retry(&self, key: &str, bytes: &[u8]) -> Result<(), TrainError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.put(key, bytes) {
                Ok(()) => return Ok(()),
                Err(err) if attempt <= self.retries => {
                    warn!(key, attempt, error = %err, "checkpoint write failed, retrying");
                    thread::sleep(self.backoff * attempt as u32);
                }
                Err(source) => {
                    return Err(TrainError::CheckpointWrite {
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{Linear, LinearConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::{MemoryStore, StoreError};

    type TestBackend = NdArray<f32>;

    fn sample_state(iteration: usize) -> TrainingState {
        TrainingState {
            epoch: 3,
            iteration,
            last_loss: 0.25,
            generator_params: 10,
            discriminator_params: 20,
            generator: vec![1, 2, 3],
            discriminator: vec![4, 5],
            optimizer_g: vec![6],
            optimizer_d: Vec::new(),
        }
    }

    #[test]
    fn save_writes_identical_iteration_and_latest_blobs() {
        let store = Arc::new(MemoryStore::new());
        let manager = CheckpointManager::in_store(store.clone());
        manager.save::<TestBackend>(&sample_state(1200)).expect("save");

        assert_eq!(
            store.keys(),
            vec!["checkpoint_1200".to_string(), "checkpoint_latest".to_string()]
        );
        assert_eq!(
            store.get("checkpoint_1200").expect("get"),
            store.get("checkpoint_latest").expect("get")
        );
    }

    #[test]
    fn restore_returns_the_saved_state() {
        let device = Default::default();
        let manager = CheckpointManager::in_store(Arc::new(MemoryStore::new()));
        manager.save::<TestBackend>(&sample_state(7)).expect("save");

        let latest = manager.restore::<TestBackend>(Some(LATEST), &device).expect("latest");
        assert_eq!(latest.epoch, 3);
        assert_eq!(latest.iteration, 7);
        assert_eq!(latest.last_loss, 0.25);
        assert_eq!(latest.generator, vec![1, 2, 3]);
        assert!(latest.optimizer_d.is_empty());

        let by_iteration = manager.restore::<TestBackend>(Some("7"), &device).expect("by id");
        assert_eq!(by_iteration.iteration, 7);
    }

    #[test]
    fn missing_snapshots_are_not_fatal() {
        let device = Default::default();
        let manager = CheckpointManager::in_store(Arc::new(MemoryStore::new()));
        assert!(manager.restore::<TestBackend>(Some(LATEST), &device).is_none());
        assert!(manager.restore::<TestBackend>(None, &device).is_none());
        assert!(matches!(
            manager.try_restore::<TestBackend>("42", &device),
            Err(RestoreError::Fetch { .. })
        ));
    }

    struct FlakyStore {
        failures: usize,
        calls: AtomicUsize,
        inner: MemoryStore,
    }

    impl BlobStore for FlakyStore {
        fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Http("unavailable".into()));
            }
            self.inner.put(key, bytes)
        }

        fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(key)
        }
    }

    #[test]
    fn writes_are_retried_before_failing() {
        let store = Arc::new(FlakyStore {
            failures: 2,
            calls: AtomicUsize::new(0),
            inner: MemoryStore::new(),
        });
        let manager = CheckpointManager::in_store(store.clone()).with_retries(2, Duration::ZERO);
        manager.save::<TestBackend>(&sample_state(5)).expect("third attempt succeeds");
        assert_eq!(store.inner.keys().len(), 2);

        let store = Arc::new(FlakyStore {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            inner: MemoryStore::new(),
        });
        let manager = CheckpointManager::in_store(store.clone()).with_retries(1, Duration::ZERO);
        let err = manager.save::<TestBackend>(&sample_state(5)).expect_err("store is down");
        assert!(matches!(
            err,
            TrainError::CheckpointWrite { attempts: 2, .. }
        ));
    }

    #[test]
    fn module_weights_round_trip_and_shape_changes_are_rejected() {
        let device = Default::default();
        let saved: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let bytes = encode_module::<TestBackend, _>(&saved, "generator").expect("encode");

        let fresh: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let restored = decode_module(fresh, &bytes, saved.num_params(), "generator", &device)
            .expect("decode");
        let input = Tensor::<TestBackend, 2>::ones([1, 4], &device);
        let a = saved.forward(input.clone()).into_data().to_vec::<f32>().expect("f32");
        let b = restored.forward(input).into_data().to_vec::<f32>().expect("f32");
        assert_eq!(a, b);

        let wider: Linear<TestBackend> = LinearConfig::new(4, 5).init(&device);
        let result = decode_module(wider, &bytes, saved.num_params(), "generator", &device);
        assert!(matches!(
            result,
            Err(RestoreError::ParamMismatch {
                expected: 25,
                found: 15,
                ..
            })
        ));
    }

    #[test]
    fn same_sized_but_reshaped_weights_are_rejected() {
        let device = Default::default();
        let saved: Linear<TestBackend> = LinearConfig::new(4, 3).with_bias(false).init(&device);
        let bytes = encode_module::<TestBackend, _>(&saved, "discriminator").expect("encode");

        let transposed: Linear<TestBackend> =
            LinearConfig::new(3, 4).with_bias(false).init(&device);
        assert_eq!(transposed.num_params(), saved.num_params());
        let result =
            decode_module(transposed, &bytes, saved.num_params(), "discriminator", &device);
        match result {
            Err(RestoreError::ShapeMismatch {
                network,
                expected,
                found,
            }) => {
                assert_eq!(network, "discriminator");
                assert_eq!(expected, vec![3, 4]);
                assert_eq!(found, vec![4, 3]);
            }
            other => panic!("expected a shape mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
