pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod init;
pub mod logger;
pub mod model;
pub mod report;
pub mod service;
pub mod stats;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use service::SuppressionService;
