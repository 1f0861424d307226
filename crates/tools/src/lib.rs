//! Support code for the TimsSDR command-line tools

pub mod config;
pub mod logging;

pub use config::InfoConfig;
pub use logging::setup_logging;
