use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-iteration log detail. Only the first iteration of a loop reports its
/// warnings and diagnostics at full level; later ones log them at debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity {
    detailed: bool,
}

impl Verbosity {
    pub fn for_iteration(idx: usize) -> Self {
        Self { detailed: idx == 0 }
    }

    pub fn info(&self, message: &str) {
        if self.detailed {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if self.detailed {
            warn!("{message}");
        } else {
            debug!("{message}");
        }
    }
}
