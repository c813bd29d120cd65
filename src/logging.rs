use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install the global `tracing` subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "snapkeep=debug" } else { "snapkeep=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Config {
            reason: format!("cannot install log subscriber: {e}"),
        })
}
