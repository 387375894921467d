//! Logging setup shared by binaries, demos and tests

mod logging;

pub use logging::{setup_logging, LogConfig};
