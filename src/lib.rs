pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod fleet;
pub mod load_config;
pub mod models;
pub mod session;
pub mod spark_client;
pub mod status;
pub mod visual_cache;

pub use error::{Error, RemoteError, Result};
