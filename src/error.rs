use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::store::StoreError;

/// A snapshot could not be turned back into training state.
///
/// Never fatal on its own: the restore boundary logs it and training starts from scratch.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("checkpoint `{key}` is unavailable: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to decode {part}: {message}")]
    Decode { part: &'static str, message: String },

    #[error("{network} has {expected} parameters but the checkpoint holds {found}")]
    ParamMismatch {
        network: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{network} parameter has shape {expected:?} but the checkpoint holds {found:?}")]
    ShapeMismatch {
        network: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// A batch could not be produced or does not have the expected layout.
#[derive(Debug, Error, Clone)]
pub enum DataStreamError {
    #[error("no images found under {0}")]
    Empty(PathBuf),

    #[error("failed to list {path}: {message}")]
    Listing { path: PathBuf, message: String },

    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("malformed batch: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    DataStream(#[from] DataStreamError),

    #[error("device error: {0}")]
    Device(String),

    #[error("failed to write checkpoint `{key}` after {attempts} attempt(s): {source}")]
    CheckpointWrite {
        key: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },

    #[error("failed to encode {part}: {message}")]
    Encode { part: &'static str, message: String },

    #[error("failed to load weights from {path}: {message}")]
    Weights { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
