//! Tracing/logging initialization. A single entry point so `main.rs` and
//! integration tests configure the same subscriber.

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber: JSON-structured output, level
/// driven by `RUST_LOG` (default `conduit=info`). Safe to call once per
/// process; a second call is a no-op (the underlying `try_init` fails
/// silently rather than panicking).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conduit=info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).json().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic_when_called_twice() {
        init_tracing();
        init_tracing();
    }
}
