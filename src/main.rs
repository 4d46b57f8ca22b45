//! # tsi CLI
//!
//! Command-line surface over the tsi core: install, remove, inspect and
//! resolve packages, and bootstrap the self-hosting toolchain.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tsi::{detect_prefix, Presenter, Settings, Tsi};

/// tsi - build packages from source under a self-contained prefix
#[derive(Parser)]
#[command(
    name = "tsi",
    version = env!("CARGO_PKG_VERSION"),
    about = "Source-based package manager",
    long_about = "tsi installs packages by fetching their sources and driving their \
                  build systems inside a controlled environment rooted at a prefix. \
                  Starting from a C compiler and a POSIX shell it can bootstrap a \
                  complete self-hosted toolchain."
)]
struct Cli {
    /// Install prefix (default: $TSI_PREFIX, or auto-detected)
    #[arg(long, global = true, value_name = "DIR")]
    prefix: Option<PathBuf>,

    /// Recipe repository directory (default: <prefix>/repo)
    #[arg(long, global = true, value_name = "DIR")]
    repo: Option<PathBuf>,

    /// More logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// No build output, errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages together with their dependencies
    Install {
        /// Packages, each as `name` or `name@version`
        #[arg(required = true)]
        packages: Vec<String>,

        /// Refetch sources even when they are cached
        #[arg(long)]
        force: bool,

        /// Show what would be built without building anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove an installed package
    Remove {
        package: String,
    },

    /// List installed packages
    List,

    /// Show a package's recipe and install state
    Info {
        package: String,
    },

    /// Print the computed build order for a package
    Resolve {
        package: String,
    },

    /// List the versions known for a package
    Versions {
        package: String,
    },

    /// Build the self-hosting toolchain set in order
    Bootstrap {
        /// Refetch sources even when they are cached
        #[arg(long)]
        force: bool,
    },
}

/// Streams build output under an active spinner, dimmed so package output
/// stays distinguishable from tsi's own lines.
struct ConsolePresenter {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ConsolePresenter {
    fn for_target(target: &str, quiet: bool) -> Self {
        let bar = if quiet || !console::user_attended() {
            None
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_message(format!("Installing {target}"));
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        };
        ConsolePresenter { bar, quiet }
    }

    fn finish(&self, outcome: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(outcome.to_string());
        }
    }
}

impl Presenter for ConsolePresenter {
    fn on_line(&self, line: &str) {
        if self.quiet {
            return;
        }
        let rendered = style(line).dim().to_string();
        match &self.bar {
            Some(bar) => bar.println(rendered),
            None => println!("{rendered}"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    tsi::logging::init(cli.verbose, cli.quiet);

    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", style("error:").red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let prefix = cli.prefix.clone().unwrap_or_else(detect_prefix);
    let mut settings = Settings::load(prefix);
    if let Some(repo) = cli.repo.clone() {
        settings.repo_dir = repo;
    }
    let mut tsi = Tsi::open(settings);

    match cli.command {
        Commands::Install {
            packages,
            force,
            dry_run,
        } => {
            if dry_run {
                for target in &packages {
                    let order = tsi.plan(target)?;
                    if order.is_empty() {
                        println!("{target} is already installed");
                    } else {
                        println!("Would install for {target}:");
                        for spec in order {
                            println!("  {spec}");
                        }
                    }
                }
                return Ok(());
            }

            watch_for_interrupt(&tsi);
            for target in &packages {
                let presenter = ConsolePresenter::for_target(target, cli.quiet);
                let result = tsi.install(target, force, &presenter).await;
                match result {
                    Ok(installed) if installed.is_empty() => {
                        presenter.finish(&format!("{target} is already installed"));
                        println!("{target} is already installed");
                    }
                    Ok(installed) => {
                        presenter.finish(&format!("Installed {target}"));
                        println!(
                            "{} {} ({} package(s): {})",
                            style("Installed").green().bold(),
                            target,
                            installed.len(),
                            installed.join(", ")
                        );
                    }
                    Err(e) => {
                        presenter.finish(&format!("Failed to install {target}"));
                        return Err(e).with_context(|| format!("Failed to install '{target}'"));
                    }
                }
            }
        }

        Commands::Remove { package } => {
            let row = tsi.remove(&package)?;
            println!(
                "{} {} {}",
                style("Removed").green().bold(),
                row.name,
                row.version
            );
        }

        Commands::List => {
            let mut rows: Vec<_> = tsi.database().packages().to_vec();
            if rows.is_empty() {
                println!("No packages installed");
                return Ok(());
            }
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            for row in rows {
                let when = DateTime::from_timestamp(row.installed_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<12} {:<17} {}",
                    row.name,
                    row.version,
                    when,
                    row.install_path.display()
                );
            }
        }

        Commands::Info { package } => {
            let Some(recipe) = tsi.repository().get_spec(&package) else {
                bail!("Package '{package}' is not in the repository");
            };
            println!("{}: {}", style("Name").bold(), recipe.name);
            println!("{}: {}", style("Version").bold(), recipe.effective_version());
            if !recipe.description.is_empty() {
                println!("{}: {}", style("Description").bold(), recipe.description);
            }
            println!("{}: {}", style("Build system").bold(), recipe.build_system);
            if let Some(kind) = &recipe.source.kind {
                println!(
                    "{}: {} {}",
                    style("Source").bold(),
                    kind.as_str(),
                    recipe.source.url.as_deref().unwrap_or("-")
                );
            }
            if !recipe.dependencies.is_empty() {
                println!(
                    "{}: {}",
                    style("Dependencies").bold(),
                    recipe.dependencies.join(", ")
                );
            }
            if !recipe.build_dependencies.is_empty() {
                println!(
                    "{}: {}",
                    style("Build dependencies").bold(),
                    recipe.build_dependencies.join(", ")
                );
            }
            match tsi.database().get(&recipe.name) {
                Some(row) => println!(
                    "{}: yes ({} under {})",
                    style("Installed").bold(),
                    row.version,
                    row.install_path.display()
                ),
                None => println!("{}: no", style("Installed").bold()),
            }
        }

        Commands::Resolve { package } => {
            let order = tsi.plan(&package)?;
            if order.is_empty() {
                println!("{package} is already installed");
            } else {
                for spec in order {
                    println!("{spec}");
                }
            }
        }

        Commands::Versions { package } => {
            let versions = tsi.repository().list_versions(&package);
            if versions.is_empty() {
                bail!("Package '{package}' is not in the repository");
            }
            for version in versions {
                println!("{version}");
            }
        }

        Commands::Bootstrap { force } => {
            watch_for_interrupt(&tsi);
            let presenter = ConsolePresenter::for_target("toolchain", cli.quiet);
            let result = tsi.bootstrap(force, &presenter).await;
            match result {
                Ok(installed) if installed.is_empty() => {
                    presenter.finish("Toolchain already bootstrapped");
                    println!("Toolchain already bootstrapped");
                }
                Ok(installed) => {
                    presenter.finish("Toolchain bootstrapped");
                    println!(
                        "{} toolchain ({} package(s))",
                        style("Bootstrapped").green().bold(),
                        installed.len()
                    );
                }
                Err(e) => {
                    presenter.finish("Bootstrap failed");
                    return Err(e).context("Bootstrap failed");
                }
            }
        }
    }

    Ok(())
}

/// Arrange for Ctrl-C to stop the pipeline between packages.
fn watch_for_interrupt(tsi: &Tsi) {
    let cancel = tsi.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing the current package");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}
