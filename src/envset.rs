//! # Build Environment Synthesis
//!
//! Computes the environment-variable set prepended to every build and
//! install command. The PATH policy depends on whether the package belongs
//! to the toolchain bootstrap set and on the strict-isolation setting.

use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::manifest::Package;
use crate::util::which;

/// Packages required to self-host a toolchain, in build order. While these
/// are being built, the host compiler and `/bin` stay reachable.
pub const BOOTSTRAP_PACKAGES: [&str; 15] = [
    "m4", "ncurses", "bash", "coreutils", "diffutils", "gawk", "grep", "sed", "make", "patch",
    "tar", "gzip", "xz", "binutils", "gcc",
];

pub fn is_bootstrap(name: &str) -> bool {
    BOOTSTRAP_PACKAGES.contains(&name)
}

/// Which phase the environment is synthesized for. Compiler search flags
/// are only injected while building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Install,
}

/// The prefix whose `bin/`, `lib/` and `include/` feed PATH and the search
/// flags. A per-package staging directory under an `/install/` segment maps
/// back to the shared parent so already-installed tools stay visible.
pub fn main_install_dir(install_dir: &Path) -> PathBuf {
    let Some(text) = install_dir.to_str() else {
        return install_dir.to_path_buf();
    };
    match text.find("/install/") {
        Some(idx) => PathBuf::from(&text[..idx + "/install".len()]),
        None => install_dir.to_path_buf(),
    }
}

/// Directory holding the host C compiler: the first of `gcc`, `clang`,
/// `cc` that `which` can find.
pub fn compiler_dir() -> Option<PathBuf> {
    for tool in ["gcc", "clang", "cc"] {
        if let Some(path) = which(tool) {
            debug!("Host C compiler: {}", path.display());
            return path.parent().map(Path::to_path_buf);
        }
    }
    warn!("No host C compiler found via which (tried gcc, clang, cc)");
    None
}

/// Synthesize the environment for one command of `package`. Package `env`
/// entries come last so they override anything synthesized here.
pub fn synthesize(
    install_dir: &Path,
    package: &Package,
    strict_isolation: bool,
    stage: Stage,
) -> Vec<(String, String)> {
    synthesize_with(
        install_dir,
        package,
        strict_isolation,
        stage,
        compiler_dir().as_deref(),
    )
}

/// Same as [`synthesize`] but with the compiler directory injected, which
/// keeps PATH composition deterministic under test.
pub fn synthesize_with(
    install_dir: &Path,
    package: &Package,
    strict_isolation: bool,
    stage: Stage,
    cc_dir: Option<&Path>,
) -> Vec<(String, String)> {
    let main = main_install_dir(install_dir);
    let prefix_bin = main.join("bin");
    let system_bin = Path::new("/bin");

    let mut env: Vec<(String, String)> = Vec::new();
    let mut segments: Vec<PathBuf> = Vec::new();

    if is_bootstrap(&package.name) {
        // Bootstrap: the self-hosted toolchain is incomplete, keep the host
        // compiler and /bin reachable.
        segments.push(prefix_bin.clone());
        if let Some(cc) = cc_dir {
            segments.push(cc.to_path_buf());
        }
        segments.push(system_bin.to_path_buf());
    } else if strict_isolation {
        let own_bash = prefix_bin.join("bash");
        segments.push(prefix_bin.clone());
        if own_bash.exists() {
            env.push(("SHELL".to_string(), own_bash.display().to_string()));
        } else {
            // No self-installed bash yet: /bin stays as the sh fallback.
            segments.push(system_bin.to_path_buf());
        }
    } else {
        if prefix_bin.exists() {
            segments.push(prefix_bin.clone());
        }
        if let Some(cc) = cc_dir {
            segments.push(cc.to_path_buf());
        }
        if system_bin.exists() {
            segments.push(system_bin.to_path_buf());
        }
    }

    let path = segments
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    env.insert(0, ("PATH".to_string(), path));

    env.push((
        "PKG_CONFIG_PATH".to_string(),
        main.join("lib/pkgconfig").display().to_string(),
    ));
    env.push((
        "LD_LIBRARY_PATH".to_string(),
        main.join("lib").display().to_string(),
    ));

    if stage == Stage::Build {
        env.push((
            "CPPFLAGS".to_string(),
            format!("-I{}", main.join("include").display()),
        ));
        env.push((
            "LDFLAGS".to_string(),
            format!("-L{}", main.join("lib").display()),
        ));
    }

    for (key, value) in &package.env {
        env.push((key.clone(), value.clone()));
    }

    env
}

/// Last-wins lookup over a synthesized environment.
pub fn env_get<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
