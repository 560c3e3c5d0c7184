//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber filtered by `level`, an `EnvFilter`
/// directive such as `"info"` or `"termbranch_core=debug"`. Invalid
/// directives fall back to `info`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init("not a valid [filter");
        assert!(!init("debug"));
    }
}
