pub mod archive;
pub mod config;
pub mod convert;
pub mod dispatcher;
mod error;
pub mod logs;
pub mod paths;
pub mod protocol;
pub mod storage;
pub mod worker;

pub use error::{EngineError, Result};
