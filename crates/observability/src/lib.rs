//! Process-wide tracing setup shared by binaries and tests.

pub mod subscriber;

pub use subscriber::{LogFormat, init_with};

/// Initialize process-wide tracing with JSON output and `RUST_LOG` filtering.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init_with(LogFormat::from_env(), subscriber::DEFAULT_FILTER);
}
