//! Small filesystem and parsing helpers shared across the crate.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use walkdir::WalkDir;

/// Write a file atomically: write to a sibling temp file, then rename.
pub fn atomic_write<P: AsRef<Path>, D: AsRef<[u8]>>(path: P, data: D) -> Result<()> {
    let path = path.as_ref();
    let temp_path = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

    file.write_all(data.as_ref())
        .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;

    file.sync_all()
        .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {} to {}", temp_path.display(), path.display()))?;

    Ok(())
}

/// Recursively copy a directory tree.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry =
            entry.with_context(|| format!("Failed to traverse directory: {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("Failed to compute relative path")?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Locate `program` with the host's `which`. Returns the full path.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    let output = std::process::Command::new("which")
        .arg(program)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(std::path::PathBuf::from(path))
    }
}

/// Parse the boolean spellings accepted in configuration files and
/// environment variables. Unrecognized values yield `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.json");
        atomic_write(&path, b"payload")?;
        assert_eq!(std::fs::read_to_string(&path)?, "payload");
        atomic_write(&path, b"second")?;
        assert_eq!(std::fs::read_to_string(&path)?, "second");
        Ok(())
    }

    #[test]
    fn test_copy_dir_recursive() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested"))?;
        std::fs::write(src.join("a.txt"), "a")?;
        std::fs::write(src.join("nested/b.txt"), "b")?;

        let dest = dir.path().join("dest");
        copy_dir_recursive(&src, &dest)?;

        assert_eq!(std::fs::read_to_string(dest.join("a.txt"))?, "a");
        assert_eq!(std::fs::read_to_string(dest.join("nested/b.txt"))?, "b");
        Ok(())
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("No"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
