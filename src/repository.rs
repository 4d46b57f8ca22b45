//! # Repository Index
//!
//! Loads every recipe manifest under a directory and indexes the resulting
//! packages for lookup by name and by (name, version).

use fs_err as fs;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::path::Path;

use crate::manifest::{self, Package, LATEST_VERSION};

/// In-memory catalog of package recipes.
#[derive(Debug, Default)]
pub struct Repository {
    packages: Vec<Package>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all `*.json` manifests under `dir`. A missing or unreadable
    /// directory yields an empty repository; individual file failures are
    /// logged and skipped.
    pub fn load(dir: &Path) -> Self {
        let mut repo = Repository::new();

        let pattern = format!("{}/*.json", dir.display());
        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Invalid repository path {}: {}", dir.display(), e);
                return repo;
            }
        };

        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable repository entry: {}", e);
                    continue;
                }
            };
            let dotfile = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if dotfile {
                continue;
            }

            match manifest::parse_manifest(&path) {
                Ok(packages) => {
                    debug!(
                        "Loaded {} recipe(s) from {}",
                        packages.len(),
                        path.display()
                    );
                    repo.packages.extend(packages);
                }
                Err(e) => warn!("Skipping manifest: {}", e),
            }
        }

        debug!(
            "Repository at {} holds {} package record(s)",
            dir.display(),
            repo.packages.len()
        );
        repo
    }

    /// Add a package. Fails when a package with the same name is already
    /// indexed.
    pub fn add(&mut self, package: Package) -> bool {
        if self.packages.iter().any(|p| p.name == package.name) {
            return false;
        }
        self.packages.push(package);
        true
    }

    /// Look up `name`, picking the lexicographically greatest version among
    /// records sharing it. A record without a version counts as `latest`.
    pub fn get(&self, name: &str) -> Option<&Package> {
        let mut best: Option<&Package> = None;
        for p in self.packages.iter().filter(|p| p.name == name) {
            match best {
                Some(b) if p.effective_version() <= b.effective_version() => {}
                _ => best = Some(p),
            }
        }
        best
    }

    /// Exact-version lookup. `None` and `latest` fall back to [`get`].
    ///
    /// [`get`]: Repository::get
    pub fn get_version(&self, name: &str, version: Option<&str>) -> Option<&Package> {
        match version {
            None | Some(LATEST_VERSION) => self.get(name),
            Some(v) => self
                .packages
                .iter()
                .find(|p| p.name == name && p.effective_version() == v),
        }
    }

    /// Look up a `name` or `name@version` dependency spec.
    pub fn get_spec(&self, spec: &str) -> Option<&Package> {
        let (name, version) = manifest::split_spec(spec);
        self.get_version(name, version)
    }

    /// All version strings known for `name`, duplicates preserved.
    pub fn list_versions(&self, name: &str) -> Vec<String> {
        self.packages
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.effective_version().to_string())
            .collect()
    }

    /// The set of distinct package names, sorted.
    pub fn list_packages(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.packages.iter().map(|p| p.name.as_str()).collect();
        names.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Write every indexed recipe back out, one manifest per package name.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        for name in self.list_packages() {
            let recipes: Vec<&Package> =
                self.packages.iter().filter(|p| p.name == name).collect();
            let value = manifest::manifest_value(&name, &recipes);
            let path = dir.join(format!("{name}.json"));
            fs::write(&path, serde_json::to_string_pretty(&value)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest_str;
    use std::path::PathBuf;

    fn pkg(name: &str, version: Option<&str>) -> Package {
        let mut text = format!(r#"{{"name": "{name}""#);
        if let Some(v) = version {
            text.push_str(&format!(r#", "version": "{v}""#));
        }
        text.push('}');
        parse_manifest_str(&text, &PathBuf::from("test.json"))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_get_picks_greatest_version() {
        let mut repo = Repository::new();
        repo.packages.push(pkg("tool", Some("1.0")));
        repo.packages.push(pkg("tool", Some("1.2")));
        repo.packages.push(pkg("tool", Some("1.1")));

        assert_eq!(repo.get("tool").unwrap().version.as_deref(), Some("1.2"));
        // idempotent
        assert_eq!(repo.get("tool").unwrap().version.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_versionless_record_wins_as_latest() {
        let mut repo = Repository::new();
        repo.packages.push(pkg("tool", Some("9.9")));
        repo.packages.push(pkg("tool", None));

        // "latest" sorts above any digit-led version string
        assert_eq!(repo.get("tool").unwrap().version, None);
    }

    #[test]
    fn test_get_version_lookup() {
        let mut repo = Repository::new();
        repo.packages.push(pkg("tool", Some("1.0")));
        repo.packages.push(pkg("tool", Some("2.0")));

        assert_eq!(
            repo.get_version("tool", Some("1.0")).unwrap().version.as_deref(),
            Some("1.0")
        );
        assert_eq!(
            repo.get_version("tool", None).unwrap().version.as_deref(),
            Some("2.0")
        );
        assert_eq!(
            repo.get_version("tool", Some("latest"))
                .unwrap()
                .version
                .as_deref(),
            Some("2.0")
        );
        assert!(repo.get_version("tool", Some("3.0")).is_none());
        assert!(repo.get_spec("tool@2.0").is_some());
    }

    #[test]
    fn test_add_rejects_duplicate_name() {
        let mut repo = Repository::new();
        assert!(repo.add(pkg("fresh", Some("1.0"))));
        assert_eq!(repo.get("fresh").unwrap().name, "fresh");
        assert!(!repo.add(pkg("fresh", Some("2.0"))));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_list_versions_and_packages() {
        let mut repo = Repository::new();
        repo.packages.push(pkg("b", Some("1")));
        repo.packages.push(pkg("a", Some("1")));
        repo.packages.push(pkg("a", Some("1")));
        repo.packages.push(pkg("a", None));

        assert_eq!(repo.list_versions("a"), vec!["1", "1", "latest"]);
        assert_eq!(repo.list_packages(), vec!["a", "b"]);
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let repo = Repository::load(Path::new("/nonexistent/recipes"));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_load_skips_bad_files_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{"name": "good"}"#).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{").unwrap();
        std::fs::write(dir.path().join(".hidden.json"), r#"{"name": "hidden"}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let repo = Repository::load(dir.path());
        assert_eq!(repo.len(), 1);
        assert!(repo.get("good").is_some());
        assert!(repo.get("hidden").is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tool.json"),
            r#"{"name": "tool", "versions": [
                {"version": "1.0", "source_type": "tarball", "source_url": "https://example.org/t-1.0.tar.gz"},
                {"version": "2.0", "source_type": "tarball", "source_url": "https://example.org/t-2.0.tar.gz"}
            ]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("single.json"),
            r#"{"name": "single", "build_system": "make", "dependencies": ["tool@1.0"]}"#,
        )
        .unwrap();

        let repo = Repository::load(dir.path());
        let out = tempfile::tempdir().unwrap();
        repo.save(out.path()).unwrap();
        let reloaded = Repository::load(out.path());

        assert_eq!(reloaded.len(), repo.len());
        assert_eq!(reloaded.list_packages(), repo.list_packages());
        assert_eq!(reloaded.list_versions("tool"), repo.list_versions("tool"));
        assert_eq!(
            reloaded.get("single").unwrap(),
            repo.get("single").unwrap()
        );
    }
}
