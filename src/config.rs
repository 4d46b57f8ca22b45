//! # Configuration
//!
//! Prefix detection and the `tsi.cfg` settings file. The file is plain
//! `key=value` lines; it is created with commented defaults on first run
//! and never rewritten afterwards, so user edits survive upgrades.

use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::util::parse_bool;

/// Settings file name, relative to the prefix.
pub const CONFIG_FILE: &str = "tsi.cfg";

/// Directory under the prefix where fetched sources are cached.
pub const SOURCES_DIR: &str = "sources";

/// Directory under the prefix holding recipe manifests.
pub const REPO_DIR: &str = "repo";

const DEFAULT_CONFIG: &str = "\
# tsi settings. Lines starting with '#' or ';' are comments.
#
# strict_isolation: build non-toolchain packages against the prefix only,
# keeping the host system out of PATH. Accepts true/false, 1/0, yes/no.
strict_isolation=false
";

/// Effective settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The prefix everything lives under: installed files, the source
    /// cache, the recipe repository, the database, the settings file.
    pub prefix: PathBuf,
    /// Where recipe manifests are loaded from.
    pub repo_dir: PathBuf,
    /// Where fetched sources are materialized.
    pub cache_dir: PathBuf,
    /// Destination passed to build systems as the install prefix.
    pub install_dir: PathBuf,
    pub strict_isolation: bool,
}

impl Settings {
    /// Assemble settings for `prefix`, reading `tsi.cfg` and writing the
    /// default file first if it does not exist yet. Failures here degrade
    /// to warnings; the defaults always apply.
    pub fn load(prefix: PathBuf) -> Self {
        let config_path = prefix.join(CONFIG_FILE);
        ensure_default_config(&config_path);

        let mut settings = Settings {
            repo_dir: prefix.join(REPO_DIR),
            cache_dir: prefix.join(SOURCES_DIR),
            install_dir: prefix.clone(),
            prefix,
            strict_isolation: false,
        };

        match std::fs::read_to_string(&config_path) {
            Ok(text) => settings.apply(&text),
            Err(e) => warn!(
                "Cannot read {}: {}; using defaults",
                config_path.display(),
                e
            ),
        }
        settings
    }

    fn apply(&mut self, text: &str) {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("Ignoring malformed settings line {}: {}", lineno + 1, line);
                continue;
            };
            match key.trim() {
                "strict_isolation" => match parse_bool(value) {
                    Some(v) => self.strict_isolation = v,
                    None => warn!(
                        "Ignoring invalid strict_isolation value on line {}: {}",
                        lineno + 1,
                        value.trim()
                    ),
                },
                other => warn!("Ignoring unknown settings key '{}'", other),
            }
        }
        debug!("strict_isolation = {}", self.strict_isolation);
    }
}

/// Create the settings file with defaults if absent. Never overwrites.
fn ensure_default_config(path: &Path) {
    if path.exists() {
        return;
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Cannot create {}: {}", parent.display(), e);
            return;
        }
    }
    match std::fs::write(path, DEFAULT_CONFIG) {
        Ok(()) => debug!("Wrote default settings to {}", path.display()),
        Err(e) => warn!("Cannot write default settings {}: {}", path.display(), e),
    }
}

/// Pick the install prefix. `TSI_PREFIX` wins; otherwise a binary living in
/// some `<dir>/bin/` claims `<dir>`; otherwise `~/.tsi`.
pub fn detect_prefix() -> PathBuf {
    if let Ok(value) = std::env::var("TSI_PREFIX") {
        if !value.is_empty() {
            return PathBuf::from(value);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(bin_dir) = exe.parent() {
            if bin_dir.file_name().map(|n| n == "bin").unwrap_or(false) {
                if let Some(root) = bin_dir.parent() {
                    return root.to_path_buf();
                }
            }
        }
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".tsi")
}
