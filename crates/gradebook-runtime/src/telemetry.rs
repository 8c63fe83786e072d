//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "gradebook=info";

/// Build the filter: `RUST_LOG` if set and valid, otherwise
/// `gradebook=info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install a fmt subscriber. Later calls are ignored, so tests and
/// embedding applications may call this freely.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("tracing initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
