pub mod agent;
pub mod beans;
pub mod config;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
