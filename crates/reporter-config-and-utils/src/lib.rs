//! Configuration, paths, logging and bootstrap for the crash reporter.

mod bootstrap;
mod config;
mod error;
mod logging;
mod paths;

pub use bootstrap::{start_transport, transport_options};
pub use config::{Config, DEFAULT_ENDPOINT, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LineFlushedWriter};
pub use paths::Paths;
