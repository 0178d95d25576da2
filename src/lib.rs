pub mod assembly;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod model;
pub mod utils;
