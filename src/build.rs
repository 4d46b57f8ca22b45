//! # Build Driver
//!
//! Runs the build-system-specific command sequence for one package inside
//! a synthesized environment. Child output (stdout and stderr merged into
//! one pipe) is split into lines, handed to the presenter for live display,
//! and retained in a bounded tail for error context.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::manifest::{BuildSystem, Package};
use crate::util::copy_dir_recursive;

/// How many output lines are kept for error context.
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Receives each completed child-output line for live display.
pub trait Presenter {
    fn on_line(&self, line: &str);
}

/// Presenter that swallows everything.
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn on_line(&self, _line: &str) {}
}

/// Build driver error types
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to apply patch {patch} to '{package}': {msg}")]
    PatchFailed {
        package: String,
        patch: PathBuf,
        msg: String,
    },

    #[error("Step '{step}' failed for '{package}' with exit code {code}")]
    StepFailed {
        package: String,
        step: String,
        code: i32,
    },

    #[error("Step '{step}' for '{package}' was terminated by signal {signal}")]
    StepSignaled {
        package: String,
        step: String,
        signal: i32,
    },

    #[error("Unknown build system '{system}' for '{package}'")]
    UnknownBuildSystem { package: String, system: String },

    #[error("Failed to run step '{step}' for '{package}': {source}")]
    Io {
        package: String,
        step: String,
        #[source]
        source: std::io::Error,
    },
}

/// Bounded ring buffer over the most recent output lines.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One spawned command of a build or install sequence.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub step: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Appended after the synthesized environment.
    pub extra_env: Vec<(String, String)>,
    /// File piped into the child's stdin.
    pub stdin: Option<PathBuf>,
    /// Non-fatal steps degrade to a warning on failure.
    pub fatal: bool,
}

impl StepCommand {
    fn new(step: &str, program: &str, args: Vec<String>, cwd: &Path) -> Self {
        StepCommand {
            step: step.to_string(),
            program: program.to_string(),
            args,
            cwd: cwd.to_path_buf(),
            extra_env: Vec::new(),
            stdin: None,
            fatal: true,
        }
    }
}

/// The build-step command sequence for `package` with sources in
/// `source_dir`, installing under `install_dir`.
pub fn build_steps(
    package: &Package,
    source_dir: &Path,
    install_dir: &Path,
) -> Result<Vec<StepCommand>, BuildError> {
    let install = install_dir.display().to_string();
    let build_dir = source_dir.join("build");

    let steps = match &package.build_system {
        BuildSystem::Autotools => {
            let mut steps = Vec::new();
            if !source_dir.join("configure").exists() {
                let mut regen = StepCommand::new(
                    "autoreconf",
                    "autoreconf",
                    vec!["-fiv".to_string()],
                    source_dir,
                );
                regen.fatal = false;
                steps.push(regen);
            }

            let mut configure_args = vec![format!("--prefix={install}")];
            configure_args.extend(package.configure_args.iter().cloned());
            steps.push(StepCommand::new(
                "configure",
                "./configure",
                configure_args,
                source_dir,
            ));

            let mut make_args = package.make_args.clone();
            if let Some(cflags) = package.env.get("CFLAGS") {
                // Passing CFLAGS on the command line beats the Makefile's
                // own assignment, which exporting alone would not.
                make_args.push(format!("CFLAGS={cflags}"));
            }
            steps.push(StepCommand::new("make", "make", make_args, source_dir));
            steps
        }

        BuildSystem::Cmake => {
            let mut configure_args = vec![
                "-S".to_string(),
                source_dir.display().to_string(),
                "-B".to_string(),
                build_dir.display().to_string(),
                format!("-DCMAKE_INSTALL_PREFIX={install}"),
            ];
            configure_args.extend(package.cmake_args.iter().cloned());

            let mut build_args = vec!["--build".to_string(), build_dir.display().to_string()];
            build_args.extend(package.make_args.iter().cloned());

            vec![
                StepCommand::new("cmake-configure", "cmake", configure_args, source_dir),
                StepCommand::new("cmake-build", "cmake", build_args, source_dir),
            ]
        }

        BuildSystem::Make => {
            vec![StepCommand::new(
                "make",
                "make",
                package.make_args.clone(),
                source_dir,
            )]
        }

        BuildSystem::Meson => {
            vec![
                StepCommand::new(
                    "meson-setup",
                    "meson",
                    vec![
                        "setup".to_string(),
                        build_dir.display().to_string(),
                        source_dir.display().to_string(),
                        format!("--prefix={install}"),
                    ],
                    source_dir,
                ),
                StepCommand::new(
                    "meson-compile",
                    "meson",
                    vec![
                        "compile".to_string(),
                        "-C".to_string(),
                        build_dir.display().to_string(),
                    ],
                    source_dir,
                ),
            ]
        }

        BuildSystem::Custom => package
            .build_commands
            .iter()
            .map(|raw| {
                // The token is substituted textually and the variable is
                // exported as well, so scripts can use either form.
                let script = raw.replace("$TSI_INSTALL_DIR", &install);
                let mut step = StepCommand::new(
                    "custom",
                    "sh",
                    vec!["-c".to_string(), script],
                    source_dir,
                );
                step.extra_env
                    .push(("TSI_INSTALL_DIR".to_string(), install.clone()));
                step
            })
            .collect(),

        BuildSystem::Other(system) => {
            return Err(BuildError::UnknownBuildSystem {
                package: package.name.clone(),
                system: system.clone(),
            })
        }
    };

    Ok(steps)
}

/// The install-step command sequence. The `custom` build system installs by
/// copying instead and yields no commands here.
pub fn install_steps(
    package: &Package,
    source_dir: &Path,
    install_dir: &Path,
) -> Result<Vec<StepCommand>, BuildError> {
    let install = install_dir.display().to_string();
    let build_dir = source_dir.join("build");

    let steps = match &package.build_system {
        BuildSystem::Autotools => vec![StepCommand::new(
            "install",
            "make",
            vec!["install".to_string()],
            source_dir,
        )],

        BuildSystem::Cmake => vec![StepCommand::new(
            "install",
            "cmake",
            vec!["--install".to_string(), build_dir.display().to_string()],
            source_dir,
        )],

        BuildSystem::Make => vec![StepCommand::new(
            "install",
            "make",
            vec!["install".to_string(), format!("PREFIX={install}")],
            source_dir,
        )],

        BuildSystem::Meson => vec![StepCommand::new(
            "install",
            "meson",
            vec![
                "install".to_string(),
                "-C".to_string(),
                build_dir.display().to_string(),
            ],
            source_dir,
        )],

        BuildSystem::Custom => Vec::new(),

        BuildSystem::Other(system) => {
            return Err(BuildError::UnknownBuildSystem {
                package: package.name.clone(),
                system: system.clone(),
            })
        }
    };

    Ok(steps)
}

/// Drives build and install sequences, streaming output through the
/// presenter.
pub struct BuildDriver<'a> {
    presenter: &'a dyn Presenter,
}

impl<'a> BuildDriver<'a> {
    pub fn new(presenter: &'a dyn Presenter) -> Self {
        Self { presenter }
    }

    /// Apply every patch of `package` to the source tree. Failures abort.
    pub async fn apply_patches(
        &self,
        package: &Package,
        source_dir: &Path,
        env: &[(String, String)],
    ) -> Result<(), BuildError> {
        for patch in &package.patches {
            info!("Applying patch {} to '{}'", patch.display(), package.name);
            let mut step =
                StepCommand::new("patch", "patch", vec!["-p1".to_string()], source_dir);
            step.stdin = Some(patch.clone());
            self.run_step(&package.name, &step, env)
                .await
                .map_err(|e| BuildError::PatchFailed {
                    package: package.name.clone(),
                    patch: patch.clone(),
                    msg: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Run the build sequence for `package`.
    pub async fn build(
        &self,
        package: &Package,
        source_dir: &Path,
        install_dir: &Path,
        env: &[(String, String)],
    ) -> Result<(), BuildError> {
        let steps = build_steps(package, source_dir, install_dir)?;
        if steps.is_empty() {
            info!("'{}' declares no build commands, nothing to do", package.name);
            return Ok(());
        }
        for step in &steps {
            self.run_step(&package.name, step, env).await?;
        }
        Ok(())
    }

    /// Run the install sequence for `package`.
    pub async fn install(
        &self,
        package: &Package,
        source_dir: &Path,
        install_dir: &Path,
        env: &[(String, String)],
    ) -> Result<(), BuildError> {
        if package.build_system == BuildSystem::Custom {
            copy_artifacts(source_dir, install_dir);
            return Ok(());
        }
        for step in &install_steps(package, source_dir, install_dir)? {
            self.run_step(&package.name, step, env).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        package: &str,
        step: &StepCommand,
        env: &[(String, String)],
    ) -> Result<(), BuildError> {
        debug!(
            "[{}] {} {} (in {})",
            package,
            step.program,
            step.args.join(" "),
            step.cwd.display()
        );

        match run_command(package, step, env, self.presenter).await {
            Ok(()) => Ok(()),
            Err(e) if !step.fatal => {
                warn!("Non-fatal step '{}' for '{}': {}", step.step, package, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Spawn one command and pump its merged output through the presenter.
async fn run_command(
    package: &str,
    step: &StepCommand,
    env: &[(String, String)],
    presenter: &dyn Presenter,
) -> Result<(), BuildError> {
    let io_err = |source: std::io::Error| BuildError::Io {
        package: package.to_string(),
        step: step.step.clone(),
        source,
    };

    let mut command = Command::new(&step.program);
    command
        .args(&step.args)
        .current_dir(&step.cwd)
        .stdout(Stdio::piped());
    for (key, value) in env.iter().chain(step.extra_env.iter()) {
        command.env(key, value);
    }
    match &step.stdin {
        Some(path) => {
            let file = std::fs::File::open(path).map_err(io_err)?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    // Point the child's stderr at the stdout pipe so the presenter sees a
    // single stream in production order.
    unsafe {
        command.pre_exec(|| {
            if libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(io_err)?;
    let mut stdout = child.stdout.take().ok_or_else(|| {
        io_err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "child stdout was not captured",
        ))
    })?;

    let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);
    let mut pending: Vec<u8> = Vec::new();
    let mut last_was_cr = false;
    let mut buf = [0u8; 4096];

    let flush = |pending: &mut Vec<u8>, tail: &mut OutputTail| {
        let line = String::from_utf8_lossy(pending).into_owned();
        presenter.on_line(&line);
        tail.push(line);
        pending.clear();
    };

    loop {
        let n = stdout.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            match byte {
                b'\n' => {
                    // CRLF already flushed at the CR
                    if last_was_cr {
                        last_was_cr = false;
                    } else {
                        flush(&mut pending, &mut tail);
                    }
                }
                b'\r' => {
                    flush(&mut pending, &mut tail);
                    last_was_cr = true;
                }
                _ => {
                    last_was_cr = false;
                    pending.push(byte);
                }
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending, &mut tail);
    }

    let status = child.wait().await.map_err(io_err)?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => {
            log_tail(package, &step.step, &tail);
            Err(BuildError::StepFailed {
                package: package.to_string(),
                step: step.step.clone(),
                code,
            })
        }
        None => {
            let signal = status.signal().unwrap_or(0);
            log_tail(package, &step.step, &tail);
            Err(BuildError::StepSignaled {
                package: package.to_string(),
                step: step.step.clone(),
                signal,
            })
        }
    }
}

fn log_tail(package: &str, step: &str, tail: &OutputTail) {
    if tail.is_empty() {
        return;
    }
    error!(
        "Last {} output line(s) of step '{}' for '{}':",
        tail.len(),
        step,
        package
    );
    for line in tail.lines() {
        error!("  {}", line);
    }
}

/// Best-effort install for the `custom` build system: copy the usual
/// artifact directories from the source tree into the prefix.
fn copy_artifacts(source_dir: &Path, install_dir: &Path) {
    for sub in ["bin", "lib", "include", "share"] {
        let from = source_dir.join(sub);
        if !from.is_dir() {
            continue;
        }
        let to = install_dir.join(sub);
        if let Err(e) = copy_dir_recursive(&from, &to) {
            warn!("Could not copy {} into the prefix: {}", from.display(), e);
        }
    }
}
