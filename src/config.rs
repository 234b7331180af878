//! Process-wide dispatch configuration

use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Parameters governing a single process's dispatch engine.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum number of worker threads running concurrently. `0` (as passed to
    /// [`init`]) is normalized to unbounded (`usize::MAX`).
    pub max_concurrency: usize,
    /// Per-worker thread stack size in bytes. `0` means the platform default.
    pub stacksize: usize,
    /// If set, an accept error that isn't `EINTR` triggers the panic protocol.
    pub panic_on_failed_accept: bool,
    /// When nonzero, every Nth accept failure (1-based) is logged; `0` never logs.
    pub log_on_failed_accept: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_concurrency: usize::MAX,
            stacksize: 0,
            panic_on_failed_accept: true,
            log_on_failed_accept: 0,
        }
    }
}

/// Fills `out` with the default configuration. Equivalent to `*out =
/// Config::default()`; kept as a function for callers that build a `Config` in place
/// before overriding individual fields.
pub fn config_init(out: &mut Config) {
    *out = Config::default();
}

static PROCESS_CONFIG: OnceCell<Arc<Config>> = OnceCell::new();

/// Installs `config` as the process-wide configuration. A `max_concurrency` of `0`
/// is normalized to unbounded. Calling this more than once (or after the engine has
/// already lazily installed a default) is [`Error::Invalid`]: the process-wide
/// configuration is single-assignment.
pub fn init(mut config: Config) -> Result<()> {
    if config.max_concurrency == 0 {
        config.max_concurrency = usize::MAX;
    }
    PROCESS_CONFIG
        .set(Arc::new(config))
        .map_err(|_| Error::invalid("dispatch configuration was already initialized"))
}

/// Returns the process-wide configuration, lazily installing the default if
/// [`init`] was never called.
pub(crate) fn current() -> Arc<Config> {
    PROCESS_CONFIG.get_or_init(|| Arc::new(Config::default())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_normalizes_unbounded_concurrency() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrency, usize::MAX);
        assert!(cfg.panic_on_failed_accept);
        assert_eq!(cfg.log_on_failed_accept, 0);
    }

    #[test]
    fn config_init_matches_default() {
        let mut cfg = Config {
            max_concurrency: 7,
            stacksize: 7,
            panic_on_failed_accept: false,
            log_on_failed_accept: 7,
        };
        config_init(&mut cfg);
        assert_eq!(cfg.max_concurrency, usize::MAX);
        assert_eq!(cfg.stacksize, 0);
        assert!(cfg.panic_on_failed_accept);
    }
}
