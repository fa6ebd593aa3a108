#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod storage;
pub mod sync;
pub mod transport;
