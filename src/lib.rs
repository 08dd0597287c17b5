pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod instance;
pub mod messages;
pub mod worker;

pub use error::{Result, WorkerError};
