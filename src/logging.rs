//! # Logging Setup
//!
//! Configures the `log` facade from `TSI_LOG_*` environment variables and
//! the CLI verbosity flags. Every failure in here degrades to a note on
//! stderr; logging problems never abort the tool.

use log::LevelFilter;

use crate::util::parse_bool;

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().as_deref().and_then(parse_bool)
}

fn level_from_env() -> Option<LevelFilter> {
    let value = std::env::var("TSI_LOG_LEVEL").ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        // developer output maps onto the trace level
        "developer" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        other => {
            eprintln!("tsi: ignoring unknown TSI_LOG_LEVEL '{other}'");
            None
        }
    }
}

/// Initialize logging. Precedence for the level: `TSI_LOG_LEVEL`, then the
/// CLI flags, then warnings-only.
pub fn init(verbose: bool, quiet: bool) {
    let level = level_from_env().unwrap_or(if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    });

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);

    // Timestamps default on; TSI_LOG_TIMESTAMPS=false strips them.
    if env_flag("TSI_LOG_TIMESTAMPS").unwrap_or(true) {
        builder.format_timestamp_secs();
    } else {
        builder.format_timestamp(None);
    }

    let to_console = env_flag("TSI_LOG_TO_CONSOLE").unwrap_or(true);
    let to_file = env_flag("TSI_LOG_TO_FILE").unwrap_or(false);

    if to_file {
        match std::env::var("TSI_LOG_FILE") {
            Ok(path) if !path.is_empty() => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => {
                    eprintln!("tsi: cannot open log file {path}: {e}; logging to stderr");
                }
            },
            _ => {
                eprintln!("tsi: TSI_LOG_TO_FILE is set but TSI_LOG_FILE is not; logging to stderr");
            }
        }
    } else if !to_console {
        builder.target(env_logger::Target::Pipe(Box::new(std::io::sink())));
    }

    // Rotation knobs (TSI_LOG_ROTATION, TSI_LOG_MAX_SIZE, TSI_LOG_MAX_FILES)
    // belong to an external log sink and are intentionally not read here.

    // a second init (tests, embedding) is harmless
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        std::env::set_var("TSI_LOG_LEVEL", "developer");
        assert_eq!(level_from_env(), Some(LevelFilter::Trace));
        std::env::set_var("TSI_LOG_LEVEL", "warning");
        assert_eq!(level_from_env(), Some(LevelFilter::Warn));
        std::env::set_var("TSI_LOG_LEVEL", "nonsense");
        assert_eq!(level_from_env(), None);
        std::env::remove_var("TSI_LOG_LEVEL");
        assert_eq!(level_from_env(), None);
    }
}
