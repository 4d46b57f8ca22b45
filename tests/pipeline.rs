//! End-to-end pipeline tests: resolve, fetch (local sources), build
//! (custom commands), install, and record, all under a throwaway prefix.

use assert_fs::prelude::*;
use predicates::prelude::*;

use tsi::{NullPresenter, Settings, Tsi, TsiError};

fn write_recipe(prefix: &assert_fs::TempDir, name: &str, body: &str) {
    prefix
        .child(format!("repo/{name}.json"))
        .write_str(body)
        .unwrap();
}

fn upstream_with_readme(prefix: &assert_fs::TempDir) -> String {
    let upstream = prefix.child("upstream");
    upstream.create_dir_all().unwrap();
    upstream.child("README").write_str("source tree\n").unwrap();
    upstream.path().display().to_string()
}

#[tokio::test]
async fn install_builds_chain_and_records_rows() {
    let prefix = assert_fs::TempDir::new().unwrap();
    let upstream = upstream_with_readme(&prefix);

    write_recipe(
        &prefix,
        "base",
        &format!(
            r#"{{"name": "base", "version": "1.0", "build_system": "custom",
                 "source_type": "local", "source_url": "{upstream}"}}"#
        ),
    );
    write_recipe(
        &prefix,
        "greeter",
        &format!(
            r#"{{"name": "greeter", "version": "2.1", "build_system": "custom",
                 "source_type": "local", "source_url": "{upstream}",
                 "dependencies": ["base"],
                 "build_commands": [
                     "mkdir -p bin",
                     "printf '#!/bin/sh\necho hello\n' > bin/greet",
                     "chmod +x bin/greet",
                     "echo built into $TSI_INSTALL_DIR"
                 ]}}"#
        ),
    );

    let mut tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));
    let installed = tsi.install("greeter", false, &NullPresenter).await.unwrap();
    assert_eq!(installed, vec!["base", "greeter"]);

    // the custom install step copied bin/ into the prefix
    prefix.child("bin/greet").assert(predicate::path::is_file());

    // both rows recorded, with declared dependencies
    let db = tsi.database();
    assert!(db.is_installed("base"));
    let row = db.get("greeter").unwrap();
    assert_eq!(row.version, "2.1");
    assert_eq!(row.dependencies, vec!["base"]);
    assert_eq!(row.install_path, prefix.path());

    // sources were cached per package and version
    prefix
        .child("sources/greeter-2.1/README")
        .assert(predicate::path::is_file());

    // a second install is a no-op
    let again = tsi.install("greeter", false, &NullPresenter).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn database_survives_reopening() {
    let prefix = assert_fs::TempDir::new().unwrap();
    let upstream = upstream_with_readme(&prefix);

    write_recipe(
        &prefix,
        "tool",
        &format!(
            r#"{{"name": "tool", "build_system": "custom",
                 "source_type": "local", "source_url": "{upstream}"}}"#
        ),
    );

    {
        let mut tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));
        tsi.install("tool", false, &NullPresenter).await.unwrap();
    }

    prefix
        .child("tsi-installed.json")
        .assert(predicate::path::is_file());

    let tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));
    let row = tsi.database().get("tool").unwrap();
    assert_eq!(row.version, "latest");
    assert!(tsi.plan("tool").unwrap().is_empty());
}

#[tokio::test]
async fn failing_dependency_aborts_before_the_target() {
    let prefix = assert_fs::TempDir::new().unwrap();
    let upstream = upstream_with_readme(&prefix);

    write_recipe(
        &prefix,
        "boom",
        &format!(
            r#"{{"name": "boom", "build_system": "custom",
                 "source_type": "local", "source_url": "{upstream}",
                 "build_commands": ["echo failing on purpose", "exit 7"]}}"#
        ),
    );
    write_recipe(
        &prefix,
        "app",
        &format!(
            r#"{{"name": "app", "build_system": "custom",
                 "source_type": "local", "source_url": "{upstream}",
                 "dependencies": ["boom"]}}"#
        ),
    );

    let mut tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));
    let err = tsi.install("app", false, &NullPresenter).await.unwrap_err();
    assert!(matches!(err, TsiError::Build(_)), "unexpected error: {err}");

    // nothing was recorded: the dependency failed, the target never ran
    assert!(!tsi.database().is_installed("boom"));
    assert!(!tsi.database().is_installed("app"));
}

#[tokio::test]
async fn unknown_package_fails_cleanly() {
    let prefix = assert_fs::TempDir::new().unwrap();
    let mut tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));

    let err = tsi.install("ghost", false, &NullPresenter).await.unwrap_err();
    assert!(matches!(err, TsiError::Resolve(_)));
}

#[tokio::test]
async fn settings_file_created_once_and_kept() {
    let prefix = assert_fs::TempDir::new().unwrap();

    let _ = Tsi::open(Settings::load(prefix.path().to_path_buf()));
    prefix
        .child("tsi.cfg")
        .assert(predicate::str::contains("strict_isolation=false"));

    prefix
        .child("tsi.cfg")
        .write_str("strict_isolation=yes\n")
        .unwrap();
    let tsi = Tsi::open(Settings::load(prefix.path().to_path_buf()));
    assert!(tsi.settings().strict_isolation);
    prefix
        .child("tsi.cfg")
        .assert(predicate::str::contains("strict_isolation=yes"));
}
