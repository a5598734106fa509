use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Level forced on the logger, or `None` to let `RUST_LOG` directives apply.
///
/// `ITR90_LOG` wins over `RUST_LOG`; `verbose` raises whatever was chosen to
/// at least `debug`.
fn forced_level(
    itr90_log: Option<&str>,
    rust_log: Option<&str>,
    verbose: bool,
) -> Option<LevelFilter> {
    let level = match parse_level(itr90_log) {
        Some(level) => level,
        None if verbose => parse_level(rust_log).unwrap_or(DEFAULT_LEVEL),
        None => return None,
    };
    Some(if verbose {
        level.max(LevelFilter::Debug)
    } else {
        level
    })
}

/// Initialize stderr logging based on `ITR90_LOG`/`RUST_LOG`.
///
/// `verbose` forces at least `debug` regardless of the environment.
/// Safe to call multiple times; the logger is installed on first call.
pub fn init_rust_logging(verbose: bool) {
    RUST_LOG_ONCE.call_once(|| {
        let itr90_log = std::env::var("ITR90_LOG").ok();
        let rust_log = std::env::var("RUST_LOG").ok();

        let forced = forced_level(itr90_log.as_deref(), rust_log.as_deref(), verbose);

        let mut builder = match forced {
            Some(level) => {
                let mut b = Builder::new();
                b.filter_level(level);
                b
            }
            None => {
                let env = Env::default().default_filter_or(level_to_str(DEFAULT_LEVEL));
                Builder::from_env(env)
            }
        };
        let _ = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}
