//! # Package Recipes
//!
//! Parsing of recipe manifests into [`Package`] records. A manifest is a
//! JSON file describing either a single package, or (when it carries a
//! top-level `versions` array) several versions of a package sharing one
//! name.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifests larger than this are skipped outright.
pub const MANIFEST_SIZE_LIMIT: u64 = 1024 * 1024;

/// Sentinel version string; a recipe without a `version` field is treated
/// as carrying this value.
pub const LATEST_VERSION: &str = "latest";

/// Manifest parsing error types
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest {path} exceeds the {limit}-byte size limit")]
    TooLarge { path: PathBuf, limit: u64 },

    #[error("Malformed manifest {path}: {msg}")]
    Malformed { path: PathBuf, msg: String },
}

/// Build system driving a package's build and install steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSystem {
    Autotools,
    Cmake,
    Make,
    Meson,
    Custom,
    /// Carries the unrecognized spelling so the build driver can report it.
    Other(String),
}

impl BuildSystem {
    pub fn parse(value: &str) -> Self {
        match value {
            "autotools" => BuildSystem::Autotools,
            "cmake" => BuildSystem::Cmake,
            "make" => BuildSystem::Make,
            "meson" => BuildSystem::Meson,
            "custom" => BuildSystem::Custom,
            other => BuildSystem::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BuildSystem::Autotools => "autotools",
            BuildSystem::Cmake => "cmake",
            BuildSystem::Make => "make",
            BuildSystem::Meson => "meson",
            BuildSystem::Custom => "custom",
            BuildSystem::Other(s) => s,
        }
    }
}

impl Default for BuildSystem {
    fn default() -> Self {
        BuildSystem::Autotools
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a package's source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Git,
    Tarball,
    Zip,
    Local,
    Other(String),
}

impl SourceKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "git" => SourceKind::Git,
            "tarball" => SourceKind::Tarball,
            "zip" => SourceKind::Zip,
            "local" => SourceKind::Local,
            other => SourceKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::Git => "git",
            SourceKind::Tarball => "tarball",
            SourceKind::Zip => "zip",
            SourceKind::Local => "local",
            SourceKind::Other(s) => s,
        }
    }
}

/// Source specification of a package. `kind` is `None` when the recipe
/// carries no `source_type`; the fetcher rejects such packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSpec {
    pub kind: Option<SourceKind>,
    pub url: Option<String>,
    /// At most one of `branch`/`tag` is honored at clone time.
    pub branch: Option<String>,
    pub tag: Option<String>,
    /// Checked out after the clone when set.
    pub commit: Option<String>,
}

/// One build recipe: the unit the repository indexes and the orchestrator
/// installs.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    pub version: Option<String>,
    pub description: String,
    pub build_system: BuildSystem,
    pub source: SourceSpec,
    pub dependencies: Vec<String>,
    pub build_dependencies: Vec<String>,
    pub configure_args: Vec<String>,
    pub cmake_args: Vec<String>,
    pub make_args: Vec<String>,
    /// Applied last, overriding any synthesized environment variable.
    pub env: BTreeMap<String, String>,
    pub patches: Vec<PathBuf>,
    /// Shell commands for the `custom` build system. May reference the
    /// `$TSI_INSTALL_DIR` token.
    pub build_commands: Vec<String>,
}

impl Package {
    /// The version string with the absent case normalized to `latest`.
    pub fn effective_version(&self) -> &str {
        self.version.as_deref().unwrap_or(LATEST_VERSION)
    }

    /// Whether `spec` appears verbatim in either dependency list.
    pub fn has_dependency(&self, spec: &str) -> bool {
        self.dependencies.iter().any(|d| d == spec)
            || self.build_dependencies.iter().any(|d| d == spec)
    }

    fn from_raw(name: String, raw: RawRecipe) -> Self {
        Package {
            name,
            version: raw.version,
            description: raw.description.unwrap_or_default(),
            build_system: raw
                .build_system
                .as_deref()
                .map(BuildSystem::parse)
                .unwrap_or_default(),
            source: SourceSpec {
                kind: raw.source_type.as_deref().map(SourceKind::parse),
                url: raw.source_url,
                branch: raw.source_branch,
                tag: raw.source_tag,
                commit: raw.source_commit,
            },
            dependencies: filter_nulls(raw.dependencies),
            build_dependencies: filter_nulls(raw.build_dependencies),
            configure_args: filter_nulls(raw.configure_args),
            cmake_args: filter_nulls(raw.cmake_args),
            make_args: filter_nulls(raw.make_args),
            env: raw.env,
            patches: filter_nulls(raw.patches),
            build_commands: filter_nulls(raw.build_commands),
        }
    }

    fn to_raw(&self) -> RawRecipe {
        RawRecipe {
            version: self.version.clone(),
            description: if self.description.is_empty() {
                None
            } else {
                Some(self.description.clone())
            },
            build_system: Some(self.build_system.as_str().to_string()),
            source_type: self.source.kind.as_ref().map(|k| k.as_str().to_string()),
            source_url: self.source.url.clone(),
            source_branch: self.source.branch.clone(),
            source_tag: self.source.tag.clone(),
            source_commit: self.source.commit.clone(),
            dependencies: wrap_some(&self.dependencies),
            build_dependencies: wrap_some(&self.build_dependencies),
            configure_args: wrap_some(&self.configure_args),
            cmake_args: wrap_some(&self.cmake_args),
            make_args: wrap_some(&self.make_args),
            env: self.env.clone(),
            patches: self.patches.iter().cloned().map(Some).collect(),
            build_commands: wrap_some(&self.build_commands),
        }
    }
}

/// Split a dependency spec `name@version` on the first `@`. A spec without
/// `@` has no version.
pub fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((name, version)) => (name, Some(version)),
        None => (spec, None),
    }
}

fn filter_nulls<T>(values: Vec<Option<T>>) -> Vec<T> {
    values.into_iter().flatten().collect()
}

fn wrap_some(values: &[String]) -> Vec<Option<String>> {
    values.iter().cloned().map(Some).collect()
}

/// The flat on-disk recipe shape. String arrays tolerate `null` entries,
/// which are filtered out; unknown keys are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawRecipe {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_commit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    build_dependencies: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    configure_args: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cmake_args: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    make_args: Vec<Option<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    patches: Vec<Option<PathBuf>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    build_commands: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    versions: Option<Vec<serde_json::Value>>,
    #[serde(flatten)]
    recipe: RawRecipe,
}

#[derive(Debug, Serialize)]
struct RawManifestOut {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    versions: Option<Vec<RawRecipe>>,
    #[serde(flatten)]
    recipe: Option<RawRecipe>,
}

/// Parse one manifest file into one or more packages.
pub fn parse_manifest(path: &Path) -> Result<Vec<Package>, ManifestError> {
    let meta = std::fs::metadata(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.len() > MANIFEST_SIZE_LIMIT {
        return Err(ManifestError::TooLarge {
            path: path.to_path_buf(),
            limit: MANIFEST_SIZE_LIMIT,
        });
    }

    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest_str(&text, path)
}

/// Parse manifest text. `path` is used for diagnostics only.
pub fn parse_manifest_str(text: &str, path: &Path) -> Result<Vec<Package>, ManifestError> {
    let raw: RawManifest = serde_json::from_str(text).map_err(|e| ManifestError::Malformed {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })?;

    let name = match raw.name {
        Some(n) if !n.is_empty() => n,
        _ => {
            return Err(ManifestError::Malformed {
                path: path.to_path_buf(),
                msg: "missing package name".to_string(),
            })
        }
    };

    match raw.versions {
        // Multi-version form: each element is a recipe minus the name.
        // Elements that fail to parse are skipped individually.
        Some(entries) => {
            let mut packages = Vec::new();
            for (idx, value) in entries.into_iter().enumerate() {
                match serde_json::from_value::<RawRecipe>(value) {
                    Ok(recipe) => packages.push(Package::from_raw(name.clone(), recipe)),
                    Err(e) => {
                        warn!(
                            "Skipping version entry {} of '{}' in {}: {}",
                            idx,
                            name,
                            path.display(),
                            e
                        );
                    }
                }
            }
            Ok(packages)
        }
        None => Ok(vec![Package::from_raw(name, raw.recipe)]),
    }
}

/// Render packages sharing one name back into manifest JSON: the flat form
/// for a single recipe, the `versions` form otherwise.
pub fn manifest_value(name: &str, recipes: &[&Package]) -> serde_json::Value {
    let out = if recipes.len() == 1 {
        RawManifestOut {
            name: name.to_string(),
            versions: None,
            recipe: Some(recipes[0].to_raw()),
        }
    } else {
        RawManifestOut {
            name: name.to_string(),
            versions: Some(recipes.iter().map(|p| p.to_raw()).collect()),
            recipe: None,
        }
    };
    serde_json::to_value(out).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Vec<Package>, ManifestError> {
        parse_manifest_str(text, Path::new("test.json"))
    }

    #[test]
    fn test_single_version_manifest() {
        let pkgs = parse(
            r#"{
                "name": "zlib",
                "version": "1.3.1",
                "description": "compression library",
                "build_system": "cmake",
                "source_type": "tarball",
                "source_url": "https://example.org/zlib-1.3.1.tar.gz",
                "dependencies": ["m4", "sed@4.9"],
                "cmake_args": ["-DBUILD_SHARED_LIBS=ON"],
                "env": {"CFLAGS": "-O2"}
            }"#,
        )
        .unwrap();

        assert_eq!(pkgs.len(), 1);
        let p = &pkgs[0];
        assert_eq!(p.name, "zlib");
        assert_eq!(p.version.as_deref(), Some("1.3.1"));
        assert_eq!(p.build_system, BuildSystem::Cmake);
        assert_eq!(p.source.kind, Some(SourceKind::Tarball));
        assert_eq!(p.dependencies, vec!["m4", "sed@4.9"]);
        assert_eq!(p.env.get("CFLAGS").map(String::as_str), Some("-O2"));
    }

    #[test]
    fn test_defaults() {
        let pkgs = parse(r#"{"name": "hello"}"#).unwrap();
        let p = &pkgs[0];
        assert_eq!(p.version, None);
        assert_eq!(p.effective_version(), LATEST_VERSION);
        assert_eq!(p.build_system, BuildSystem::Autotools);
        assert_eq!(p.source.kind, None);
        assert!(p.dependencies.is_empty());
    }

    #[test]
    fn test_multi_version_manifest() {
        let pkgs = parse(
            r#"{
                "name": "gcc",
                "versions": [
                    {"version": "13.2.0", "source_type": "tarball", "source_url": "https://example.org/gcc-13.2.0.tar.xz"},
                    {"version": "14.1.0", "source_type": "tarball", "source_url": "https://example.org/gcc-14.1.0.tar.xz"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(pkgs.len(), 2);
        assert!(pkgs.iter().all(|p| p.name == "gcc"));
        assert_eq!(pkgs[0].version.as_deref(), Some("13.2.0"));
        assert_eq!(pkgs[1].version.as_deref(), Some("14.1.0"));
    }

    #[test]
    fn test_multi_version_skips_invalid_entries() {
        let pkgs = parse(
            r#"{
                "name": "bash",
                "versions": [
                    {"version": 5},
                    {"version": "5.2"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].version.as_deref(), Some("5.2"));
    }

    #[test]
    fn test_missing_name_is_malformed() {
        assert!(matches!(
            parse(r#"{"version": "1.0"}"#),
            Err(ManifestError::Malformed { .. })
        ));
        assert!(matches!(
            parse(r#"{"name": ""}"#),
            Err(ManifestError::Malformed { .. })
        ));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            parse("not json"),
            Err(ManifestError::Malformed { .. })
        ));
    }

    #[test]
    fn test_nulls_filtered_from_string_arrays() {
        let pkgs = parse(
            r#"{"name": "x", "dependencies": ["a", null, "b"], "make_args": [null]}"#,
        )
        .unwrap();
        assert_eq!(pkgs[0].dependencies, vec!["a", "b"]);
        assert!(pkgs[0].make_args.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let pkgs = parse(r#"{"name": "x", "maintainer": "nobody", "priority": 3}"#).unwrap();
        assert_eq!(pkgs[0].name, "x");
    }

    #[test]
    fn test_unknown_build_system_is_carried() {
        let pkgs = parse(r#"{"name": "x", "build_system": "bazel"}"#).unwrap();
        assert_eq!(
            pkgs[0].build_system,
            BuildSystem::Other("bazel".to_string())
        );
    }

    #[test]
    fn test_has_dependency_exact_match() {
        let pkgs = parse(
            r#"{"name": "x", "dependencies": ["y@2"], "build_dependencies": ["z"]}"#,
        )
        .unwrap();
        let p = &pkgs[0];
        assert!(p.has_dependency("y@2"));
        assert!(p.has_dependency("z"));
        // no normalization: the bare name does not match a pinned spec
        assert!(!p.has_dependency("y"));
    }

    #[test]
    fn test_split_spec() {
        assert_eq!(split_spec("gcc"), ("gcc", None));
        assert_eq!(split_spec("gcc@13.2.0"), ("gcc", Some("13.2.0")));
        assert_eq!(split_spec("a@b@c"), ("a", Some("b@c")));
    }

    #[test]
    fn test_manifest_round_trip() {
        let original = parse(
            r#"{
                "name": "ncurses",
                "version": "6.4",
                "build_system": "autotools",
                "source_type": "tarball",
                "source_url": "https://example.org/ncurses-6.4.tar.gz",
                "configure_args": ["--with-shared"],
                "env": {"CPPFLAGS": "-P"}
            }"#,
        )
        .unwrap();

        let value = manifest_value("ncurses", &[&original[0]]);
        let reparsed = parse(&value.to_string()).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        let mut text = String::from(r#"{"name": "big", "description": ""#);
        text.push_str(&"x".repeat(MANIFEST_SIZE_LIMIT as usize));
        text.push_str("\"}");
        std::fs::write(&path, text).unwrap();

        assert!(matches!(
            parse_manifest(&path),
            Err(ManifestError::TooLarge { .. })
        ));
    }
}
