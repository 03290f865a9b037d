//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call `init` to install a tracing
//! subscriber (i.e., something that emits events to a log).
//!
//! The rest of the program can include `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`,
//! and `error!()` macros.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const LOG_FILE: &str = "log.txt";

/// Initialize logging.
///
/// Logs to stdout, filtering according to environment variable RUST_LOG,
/// overriding the default level (ERROR) to INFO. With `file_logging`, every
/// line is additionally appended to `log.txt` in the working directory.
pub fn init(file_logging: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer());

    if file_logging {
        match OpenOptions::new().create(true).append(true).open(LOG_FILE) {
            Ok(file) => {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                    .init();
                return;
            }
            Err(e) => {
                registry.init();
                error!("Failed to open {LOG_FILE} ({e}), logging to stdout only.");
                return;
            }
        }
    }

    registry.init();
}
