//! # tsi
//!
//! A source-based package manager: recipes name where sources live and how
//! they build; tsi resolves their dependency closure, fetches sources,
//! drives the build systems inside a synthesized environment under a
//! user-chosen prefix, and records what it installed.
//!
//! Built for hosts without a distribution package manager: starting from a
//! C compiler and a POSIX shell, the fixed bootstrap set self-hosts a
//! toolchain under the prefix, after which further packages can be built
//! in isolation from the host system.
//!
//! ## Pipeline
//! ```text
//! resolve -> order -> for each package: fetch -> build -> install -> record
//! ```

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod build;
pub mod config;
pub mod database;
pub mod envset;
pub mod fetch;
pub mod logging;
pub mod manifest;
pub mod repository;
pub mod resolver;
pub mod util;

pub use build::{BuildDriver, NullPresenter, Presenter};
pub use config::{detect_prefix, Settings};
pub use database::{InstalledDb, InstalledPackage};
pub use envset::BOOTSTRAP_PACKAGES;
pub use manifest::{BuildSystem, Package, SourceKind};
pub use repository::Repository;
pub use resolver::Resolver;

/// Top-level error type aggregating every subsystem.
#[derive(Error, Debug)]
pub enum TsiError {
    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),

    #[error(transparent)]
    Resolve(#[from] resolver::ResolveError),

    #[error(transparent)]
    Fetch(#[from] fetch::FetchError),

    #[error(transparent)]
    Build(#[from] build::BuildError),

    #[error(transparent)]
    Database(#[from] database::DatabaseError),

    #[error("Another process holds the lock on {prefix}")]
    LockContended { prefix: PathBuf },

    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    #[error("Interrupted; stopped before '{0}'")]
    Interrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The orchestrator: one repository, one installed-package database, one
/// prefix. Packages in the computed order are processed strictly one after
/// another.
pub struct Tsi {
    settings: Settings,
    repo: Repository,
    db: InstalledDb,
    cancel: Arc<AtomicBool>,
}

impl Tsi {
    /// Load the repository and database for `settings`.
    pub fn open(settings: Settings) -> Self {
        if let Err(e) = std::fs::create_dir_all(&settings.prefix) {
            warn!(
                "Cannot create prefix {}: {}",
                settings.prefix.display(),
                e
            );
        }
        let repo = Repository::load(&settings.repo_dir);
        let db = InstalledDb::open(&settings.prefix);
        Tsi {
            settings,
            repo,
            db,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn database(&self) -> &InstalledDb {
        &self.db
    }

    /// Flag checked between packages; setting it stops the pipeline before
    /// the next package starts.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The ordered list of packages an install of `target` would build,
    /// dependencies first. Empty when `target` is already installed.
    pub fn plan(&self, target: &str) -> Result<Vec<String>, TsiError> {
        let resolver = Resolver::new(&self.repo);
        let closure = resolver.resolve(target, self.db.packages())?;
        Ok(resolver.build_order(&closure)?)
    }

    /// Install `target` and everything it needs. Returns the packages that
    /// were installed, in order. Aborts at the first failure; previously
    /// installed packages stay installed.
    pub async fn install(
        &mut self,
        target: &str,
        force: bool,
        presenter: &dyn Presenter,
    ) -> Result<Vec<String>, TsiError> {
        let lock_file = self.open_lock_file();
        let _guard = self.acquire_lock(lock_file.as_ref())?;

        let order = self.plan(target)?;
        if order.is_empty() {
            info!("'{}' is already installed", target);
            return Ok(Vec::new());
        }
        info!("Install order for '{}': {}", target, order.join(", "));

        let install_dir = self.settings.install_dir.clone();
        let main_dir = envset::main_install_dir(&install_dir);
        let fetcher = fetch::Fetcher::new(self.settings.cache_dir.clone(), main_dir.join("bin"));
        let driver = BuildDriver::new(presenter);

        let mut installed = Vec::new();
        for name in &order {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted; {} package(s) left unbuilt", order.len() - installed.len());
                return Err(TsiError::Interrupted(name.clone()));
            }

            let package = self
                .repo
                .get(name)
                .ok_or_else(|| resolver::ResolveError::UnknownPackage(name.clone()))?
                .clone();
            info!(
                "Processing '{}' ({}, {} build)",
                package.name,
                package.effective_version(),
                package.build_system
            );

            let source_dir = fetcher.fetch(&package, force).await?;

            let build_env = envset::synthesize(
                &install_dir,
                &package,
                self.settings.strict_isolation,
                envset::Stage::Build,
            );
            driver
                .apply_patches(&package, &source_dir, &build_env)
                .await?;
            driver
                .build(&package, &source_dir, &install_dir, &build_env)
                .await?;

            let install_env = envset::synthesize(
                &install_dir,
                &package,
                self.settings.strict_isolation,
                envset::Stage::Install,
            );
            driver
                .install(&package, &source_dir, &install_dir, &install_env)
                .await?;

            self.db.add(
                &package.name,
                package.effective_version(),
                &install_dir,
                package.dependencies.clone(),
            );
            self.db.save()?;
            info!("Installed '{}'", package.name);
            installed.push(name.clone());
        }

        Ok(installed)
    }

    /// Install the toolchain bootstrap set in its fixed order, skipping
    /// entries that are already installed.
    pub async fn bootstrap(
        &mut self,
        force: bool,
        presenter: &dyn Presenter,
    ) -> Result<Vec<String>, TsiError> {
        let mut installed = Vec::new();
        for name in BOOTSTRAP_PACKAGES {
            if self.db.is_installed(name) {
                debug!("Bootstrap package '{}' already installed", name);
                continue;
            }
            installed.extend(self.install(name, force, presenter).await?);
        }
        Ok(installed)
    }

    /// Forget `name` and delete its staging directory, if it had one.
    /// Files installed into the shared prefix are left in place.
    pub fn remove(&mut self, name: &str) -> Result<InstalledPackage, TsiError> {
        let lock_file = self.open_lock_file();
        let _guard = self.acquire_lock(lock_file.as_ref())?;

        for other in self.db.packages() {
            if other.name == name {
                continue;
            }
            let Some(recipe) = self.repo.get_version(&other.name, Some(&other.version)) else {
                continue;
            };
            let depends = recipe.has_dependency(name)
                || recipe
                    .dependencies
                    .iter()
                    .chain(recipe.build_dependencies.iter())
                    .any(|d| manifest::split_spec(d).0 == name);
            if depends {
                warn!("Installed package '{}' still depends on '{}'", other.name, name);
            }
        }

        let row = self
            .db
            .remove(name)
            .ok_or_else(|| TsiError::NotInstalled(name.to_string()))?;

        let main_dir = envset::main_install_dir(&row.install_path);
        if row.install_path != main_dir {
            match std::fs::remove_dir_all(&row.install_path) {
                Ok(()) => info!("Removed {}", row.install_path.display()),
                Err(e) => warn!(
                    "Could not remove {}: {}",
                    row.install_path.display(),
                    e
                ),
            }
        } else {
            warn!(
                "'{}' was installed into the shared prefix; its files remain under {}",
                name,
                row.install_path.display()
            );
        }

        self.db.save()?;
        Ok(row)
    }

    fn open_lock_file(&self) -> Option<std::fs::File> {
        let path = self.settings.prefix.join(".tsi.lock");
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
        {
            Ok(file) => Some(file),
            Err(e) => {
                // proceeding unlocked is better than refusing to work
                warn!("Cannot open lock file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn acquire_lock<'f>(
        &self,
        file: Option<&'f std::fs::File>,
    ) -> Result<Option<file_guard::FileGuard<&'f std::fs::File>>, TsiError> {
        let Some(file) = file else {
            return Ok(None);
        };
        match file_guard::try_lock(file, file_guard::Lock::Exclusive, 0, 1) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(TsiError::LockContended {
                prefix: self.settings.prefix.clone(),
            }),
            Err(e) => {
                warn!("Cannot lock prefix: {}; continuing without a lock", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tsi_with_repo(manifests: &[&str]) -> (tempfile::TempDir, Tsi) {
        let dir = tempdir().unwrap();
        let prefix = dir.path().to_path_buf();
        let repo_dir = prefix.join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        for (i, text) in manifests.iter().enumerate() {
            std::fs::write(repo_dir.join(format!("{i}.json")), text).unwrap();
        }
        let tsi = Tsi::open(Settings::load(prefix));
        (dir, tsi)
    }

    #[test]
    fn test_plan_orders_dependencies_first() {
        let (_dir, tsi) = tsi_with_repo(&[
            r#"{"name": "a", "dependencies": ["b"]}"#,
            r#"{"name": "b", "dependencies": ["c"]}"#,
            r#"{"name": "c"}"#,
        ]);
        assert_eq!(tsi.plan("a").unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_install_of_installed_target_is_a_noop() {
        let (_dir, mut tsi) = tsi_with_repo(&[r#"{"name": "a"}"#]);
        tsi.db.add("a", "latest", &tsi.settings.prefix.clone(), Vec::new());

        let installed = tsi.install("a", false, &NullPresenter).await.unwrap();
        assert!(installed.is_empty());
    }

    #[test]
    fn test_remove_unknown_package() {
        let (_dir, mut tsi) = tsi_with_repo(&[]);
        assert!(matches!(
            tsi.remove("ghost"),
            Err(TsiError::NotInstalled(_))
        ));
    }

    #[test]
    fn test_remove_succeeds_when_dependents_remain() {
        let (_dir, mut tsi) = tsi_with_repo(&[
            r#"{"name": "lib"}"#,
            r#"{"name": "app", "dependencies": ["lib"]}"#,
        ]);
        let prefix = tsi.settings.prefix.clone();
        tsi.db.add("lib", "latest", &prefix, Vec::new());
        tsi.db.add("app", "latest", &prefix, vec!["lib".to_string()]);

        // removal is not blocked, only warned about
        tsi.remove("lib").unwrap();
        assert!(!tsi.database().is_installed("lib"));
        assert!(tsi.database().is_installed("app"));
    }

    #[test]
    fn test_remove_deletes_staging_directory_only() {
        let (dir, mut tsi) = tsi_with_repo(&[]);

        let staging = dir.path().join("install/zlib-1.3");
        std::fs::create_dir_all(&staging).unwrap();
        tsi.db.add("zlib", "1.3", &staging, Vec::new());

        let shared = dir.path().to_path_buf();
        tsi.db.add("bash", "5.2", &shared, Vec::new());

        tsi.remove("zlib").unwrap();
        assert!(!staging.exists());

        tsi.remove("bash").unwrap();
        assert!(shared.exists());
        assert!(tsi.database().packages().is_empty());
    }
}
