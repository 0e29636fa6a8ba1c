use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "keto=info,warn";
/// Default filter with `--verbose`.
pub const VERBOSE_FILTER: &str = "keto=debug,info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable output (client and one-shot commands).
    Human,
    /// Structured JSON output (the long-running server).
    Json,
}

/// Filter directives for the given verbosity. `RUST_LOG` still wins in [`init`].
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }
}

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Call once at program startup.
pub fn init(format: LogFormat, verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
        LogFormat::Json => {
            let subscriber = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(false), "keto=info,warn");
        assert_eq!(default_filter(true), "keto=debug,info");
    }

    #[test]
    fn test_filters_parse() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert!(EnvFilter::try_new(VERBOSE_FILTER).is_ok());
    }
}
