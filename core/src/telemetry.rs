// Tracing setup for binaries embedding the gateway
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install a compact fmt subscriber filtered by `RUST_LOG`.
///
/// Returns false when a global subscriber was already installed, so calling
/// this from tests or from several entry points is harmless. Libraries should
/// leave the choice of subscriber to the binary.
pub fn init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
