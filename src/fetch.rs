//! # Source Fetching
//!
//! Materializes a package's source tree into the cache directory: shallow
//! git clones, downloaded tarballs and zip files (extracted and
//! normalized), or recursive copies of local paths. Fetches are idempotent
//! per cache directory unless forced.

use log::{debug, info};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;

use crate::manifest::{Package, SourceKind, LATEST_VERSION};
use crate::util::{copy_dir_recursive, which};

/// Fetcher error types
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Package '{0}' has no usable source specification")]
    NoSource(String),

    #[error("Unknown source type '{kind}' for '{package}'")]
    UnknownSourceType { package: String, kind: String },

    #[error("No downloader available (looked for wget and curl)")]
    NoDownloader,

    #[error("Download of {url} failed: {msg}")]
    DownloadFailed { url: String, msg: String },

    #[error("Clone of {url} failed: {msg}")]
    CloneFailed { url: String, msg: String },

    #[error("Extraction of {archive} failed: {msg}")]
    ExtractFailed { archive: PathBuf, msg: String },

    #[error("I/O error while fetching '{package}': {source}")]
    Io {
        package: String,
        #[source]
        source: std::io::Error,
    },
}

/// Detected archive shape. Compressed formats may still turn out to hold a
/// tar stream inside; that is discovered during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Xz,
    Gzip,
    Bzip2,
    Tar,
    Zip,
}

/// Suffix-based format detection.
pub fn detect_by_suffix(name: &str) -> Option<ArchiveFormat> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.xz") || lower.ends_with(".txz") || lower.ends_with(".xz") {
        Some(ArchiveFormat::Xz)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".gz") {
        Some(ArchiveFormat::Gzip)
    } else if lower.ends_with(".tar.bz2")
        || lower.ends_with(".tbz")
        || lower.ends_with(".tbz2")
        || lower.ends_with(".bz2")
    {
        Some(ArchiveFormat::Bzip2)
    } else if lower.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else if lower.ends_with(".zip") {
        Some(ArchiveFormat::Zip)
    } else {
        None
    }
}

/// Magic-byte format detection over the file header.
pub fn detect_by_magic(path: &Path) -> Option<ArchiveFormat> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut header = [0u8; 512];
    let mut read = 0;
    while read < header.len() {
        match file.read(&mut header[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(_) => return None,
        }
    }

    if read >= 6 && header[..6] == [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00] {
        Some(ArchiveFormat::Xz)
    } else if read >= 2 && header[..2] == [0x1F, 0x8B] {
        Some(ArchiveFormat::Gzip)
    } else if read >= 2 && header[..2] == [0x42, 0x5A] {
        Some(ArchiveFormat::Bzip2)
    } else if read >= 4 && header[..4] == [0x50, 0x4B, 0x03, 0x04] {
        Some(ArchiveFormat::Zip)
    } else if read >= 262 && &header[257..262] == b"ustar" {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

/// Materializes package sources under one cache root.
pub struct Fetcher {
    cache_root: PathBuf,
    /// `bin/` of the main install prefix; a self-installed wget there is
    /// preferred over host tools.
    prefix_bin: PathBuf,
}

impl Fetcher {
    pub fn new(cache_root: PathBuf, prefix_bin: PathBuf) -> Self {
        Self {
            cache_root,
            prefix_bin,
        }
    }

    /// The cache directory a package's source lands in.
    pub fn source_dir(&self, package: &Package) -> PathBuf {
        match package.version.as_deref() {
            Some(version) if version != LATEST_VERSION => self
                .cache_root
                .join(format!("{}-{}", package.name, version)),
            _ => self.cache_root.join(&package.name),
        }
    }

    /// Fetch the package's source, returning the directory holding it. An
    /// existing directory is reused unless `force` is set; forcing also
    /// discards any previously downloaded archive so the source really is
    /// fetched again.
    pub async fn fetch(&self, package: &Package, force: bool) -> Result<PathBuf, FetchError> {
        let io_err = |source: std::io::Error| FetchError::Io {
            package: package.name.clone(),
            source,
        };

        let dest = self.source_dir(package);
        if dest.exists() {
            if !force {
                debug!("Source for '{}' already cached at {}", package.name, dest.display());
                return Ok(dest);
            }
            info!("Refetching '{}': removing {}", package.name, dest.display());
            std::fs::remove_dir_all(&dest).map_err(io_err)?;
        }
        std::fs::create_dir_all(&self.cache_root).map_err(io_err)?;

        let source = &package.source;
        match &source.kind {
            None => return Err(FetchError::NoSource(package.name.clone())),
            Some(SourceKind::Git) => {
                let url = source
                    .url
                    .as_deref()
                    .ok_or_else(|| FetchError::NoSource(package.name.clone()))?;
                self.clone_git(package, url, &dest).await?;
            }
            Some(SourceKind::Tarball) => {
                let url = source
                    .url
                    .as_deref()
                    .ok_or_else(|| FetchError::NoSource(package.name.clone()))?;
                self.download_and_extract(package, url, &dest, None, force)
                    .await?;
            }
            Some(SourceKind::Zip) => {
                let url = source
                    .url
                    .as_deref()
                    .ok_or_else(|| FetchError::NoSource(package.name.clone()))?;
                self.download_and_extract(package, url, &dest, Some(ArchiveFormat::Zip), force)
                    .await?;
            }
            Some(SourceKind::Local) => {
                let path = source
                    .url
                    .as_deref()
                    .ok_or_else(|| FetchError::NoSource(package.name.clone()))?;
                info!("Copying local source {} for '{}'", path, package.name);
                copy_dir_recursive(Path::new(path), &dest).map_err(|e| FetchError::Io {
                    package: package.name.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })?;
            }
            Some(SourceKind::Other(kind)) => {
                return Err(FetchError::UnknownSourceType {
                    package: package.name.clone(),
                    kind: kind.clone(),
                })
            }
        }

        Ok(dest)
    }

    async fn clone_git(
        &self,
        package: &Package,
        url: &str,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let source = &package.source;
        let mut args: Vec<String> = vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
        ];
        // tag beats branch when both are given
        if let Some(tag) = &source.tag {
            args.push("--branch".to_string());
            args.push(tag.clone());
        } else if let Some(branch) = &source.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        args.push(url.to_string());
        args.push(dest.display().to_string());

        info!("Cloning {} for '{}'", url, package.name);
        let output = Command::new("git")
            .args(&args)
            .output()
            .await
            .map_err(|source| FetchError::Io {
                package: package.name.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(FetchError::CloneFailed {
                url: url.to_string(),
                msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if let Some(commit) = &source.commit {
            debug!("Checking out {} in {}", commit, dest.display());
            let output = Command::new("git")
                .args(["checkout", commit])
                .current_dir(dest)
                .output()
                .await
                .map_err(|source| FetchError::Io {
                    package: package.name.clone(),
                    source,
                })?;
            if !output.status.success() {
                return Err(FetchError::CloneFailed {
                    url: url.to_string(),
                    msg: format!(
                        "checkout of {} failed: {}",
                        commit,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }

        Ok(())
    }

    async fn download_and_extract(
        &self,
        package: &Package,
        url: &str,
        dest: &Path,
        format_override: Option<ArchiveFormat>,
        force: bool,
    ) -> Result<(), FetchError> {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("download");
        let archive = self.cache_root.join(file_name);

        // a forced refetch must not resurrect a stale download
        if force && archive.exists() {
            debug!("Discarding cached download {}", archive.display());
            std::fs::remove_file(&archive).map_err(|source| FetchError::Io {
                package: package.name.clone(),
                source,
            })?;
        }

        self.download(package, url, &archive).await?;
        extract_archive(&archive, dest, format_override)
    }

    async fn download(
        &self,
        package: &Package,
        url: &str,
        archive: &Path,
    ) -> Result<(), FetchError> {
        if archive
            .metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
        {
            debug!("Reusing downloaded file {}", archive.display());
            return Ok(());
        }

        let io_err = |source: std::io::Error| FetchError::Io {
            package: package.name.clone(),
            source,
        };

        // Download through a temp file so an interrupted transfer never
        // leaves a half-written archive behind.
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.cache_root)
            .map_err(io_err)?
            .into_temp_path();

        let downloader = self.pick_downloader()?;
        let args = downloader.args(url, &staging, console::user_attended());
        info!("Downloading {} via {}", url, downloader.path.display());

        let status = Command::new(&downloader.path)
            .args(&args)
            .status()
            .await
            .map_err(io_err)?;

        if !status.success() {
            return Err(FetchError::DownloadFailed {
                url: url.to_string(),
                msg: format!("{} exited with {}", downloader.path.display(), status),
            });
        }
        if staging.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            return Err(FetchError::DownloadFailed {
                url: url.to_string(),
                msg: "downloaded file is empty".to_string(),
            });
        }

        staging.persist(archive).map_err(|e| FetchError::Io {
            package: package.name.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    fn pick_downloader(&self) -> Result<Downloader, FetchError> {
        let own_wget = self.prefix_bin.join("wget");
        if own_wget.is_file() {
            return Ok(Downloader::wget(own_wget));
        }
        if let Some(path) = which("wget") {
            return Ok(Downloader::wget(path));
        }
        if let Some(path) = which("curl") {
            return Ok(Downloader::curl(path));
        }
        Err(FetchError::NoDownloader)
    }
}

enum DownloaderKind {
    Wget,
    Curl,
}

struct Downloader {
    kind: DownloaderKind,
    path: PathBuf,
}

impl Downloader {
    fn wget(path: PathBuf) -> Self {
        Downloader {
            kind: DownloaderKind::Wget,
            path,
        }
    }

    fn curl(path: PathBuf) -> Self {
        Downloader {
            kind: DownloaderKind::Curl,
            path,
        }
    }

    fn args(&self, url: &str, out: &Path, tty: bool) -> Vec<String> {
        let mut args = Vec::new();
        match self.kind {
            DownloaderKind::Wget => {
                if tty {
                    // BusyBox wget has no --progress; its default output is
                    // already a bare progress line
                    if !is_busybox_wget(&self.path) {
                        args.push("--progress=bar:force".to_string());
                    }
                } else {
                    args.push("-q".to_string());
                }
                args.push("-O".to_string());
                args.push(out.display().to_string());
                args.push(url.to_string());
            }
            DownloaderKind::Curl => {
                args.push("-f".to_string());
                args.push("-L".to_string());
                args.push(if tty { "-#" } else { "-sS" }.to_string());
                args.push("-o".to_string());
                args.push(out.display().to_string());
                args.push(url.to_string());
            }
        }
        args
    }
}

static BUSYBOX_CACHE: Lazy<Mutex<HashMap<PathBuf, bool>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Whether the wget at `path` is BusyBox's applet, probed once per binary
/// path and cached.
fn is_busybox_wget(path: &Path) -> bool {
    if let Ok(cache) = BUSYBOX_CACHE.lock() {
        if let Some(known) = cache.get(path) {
            return *known;
        }
    }

    let busybox = probe_for_busybox(path, "--version") || probe_for_busybox(path, "--help");
    if busybox {
        debug!("{} identifies as BusyBox wget", path.display());
    }
    if let Ok(mut cache) = BUSYBOX_CACHE.lock() {
        cache.insert(path.to_path_buf(), busybox);
    }
    busybox
}

fn probe_for_busybox(path: &Path, flag: &str) -> bool {
    match std::process::Command::new(path).arg(flag).output() {
        Ok(output) => {
            String::from_utf8_lossy(&output.stdout).contains("BusyBox")
                || String::from_utf8_lossy(&output.stderr).contains("BusyBox")
        }
        Err(_) => false,
    }
}

/// Extract `archive` into `dest`, trying detected formats first and the
/// blind fallback chain last. Succeeds only when the destination ends up
/// with at least one non-dotfile; a single top-level directory is flattened
/// away so `dest` itself is the source root.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    format_override: Option<ArchiveFormat>,
) -> Result<(), FetchError> {
    let formats: Vec<ArchiveFormat> = match format_override {
        Some(format) => vec![format],
        None => {
            let detected = archive
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(detect_by_suffix)
                .or_else(|| detect_by_magic(archive));
            match detected {
                Some(format) => vec![format],
                None => vec![
                    ArchiveFormat::Xz,
                    ArchiveFormat::Gzip,
                    ArchiveFormat::Bzip2,
                    ArchiveFormat::Tar,
                ],
            }
        }
    };

    let io_err = |source: std::io::Error| FetchError::ExtractFailed {
        archive: archive.to_path_buf(),
        msg: source.to_string(),
    };

    let mut last_msg = String::from("no extraction strategy succeeded");
    for format in formats {
        reset_dir(dest).map_err(io_err)?;
        match extract_as(format, archive, dest) {
            Ok(()) => {
                if dir_has_content(dest) {
                    flatten_single_dir(dest).map_err(io_err)?;
                    debug!("Extracted {} as {:?}", archive.display(), format);
                    return Ok(());
                }
                last_msg = "destination is empty after extraction".to_string();
            }
            Err(e) => {
                debug!(
                    "Extracting {} as {:?} failed: {}",
                    archive.display(),
                    format,
                    e
                );
                last_msg = e.to_string();
            }
        }
    }

    Err(FetchError::ExtractFailed {
        archive: archive.to_path_buf(),
        msg: last_msg,
    })
}

fn extract_as(format: ArchiveFormat, archive: &Path, dest: &Path) -> std::io::Result<()> {
    match format {
        ArchiveFormat::Zip => {
            let file = std::fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            zip.extract(dest)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }
        ArchiveFormat::Tar => {
            let file = std::fs::File::open(archive)?;
            tar::Archive::new(file).unpack(dest)
        }
        ArchiveFormat::Xz | ArchiveFormat::Gzip | ArchiveFormat::Bzip2 => {
            // Most compressed sources hold a tar stream; a bare compressed
            // file decompresses to a single output file instead.
            let file = std::fs::File::open(archive)?;
            let unpacked = tar::Archive::new(decoder(format, file)).unpack(dest);
            match unpacked {
                Ok(()) => Ok(()),
                Err(_) => {
                    reset_dir(dest)?;
                    let file = std::fs::File::open(archive)?;
                    let mut reader = decoder(format, file);
                    let name = archive
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "data".to_string());
                    let mut out = std::fs::File::create(dest.join(name))?;
                    std::io::copy(&mut reader, &mut out)?;
                    Ok(())
                }
            }
        }
    }
}

fn decoder(format: ArchiveFormat, file: std::fs::File) -> Box<dyn Read> {
    match format {
        ArchiveFormat::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        ArchiveFormat::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        ArchiveFormat::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        ArchiveFormat::Tar | ArchiveFormat::Zip => Box::new(file),
    }
}

fn reset_dir(dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)
}

fn dir_has_content(dest: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dest) else {
        return false;
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with('.') {
            return true;
        }
    }
    false
}

/// When an archive ships everything inside one `<name>-<version>/` style
/// directory, hoist its contents so the package directory is the source
/// root.
fn flatten_single_dir(dest: &Path) -> std::io::Result<()> {
    let entries: Vec<std::fs::DirEntry> =
        std::fs::read_dir(dest)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }

    let staged = dest.join(".flatten");
    std::fs::rename(entries[0].path(), &staged)?;
    for entry in std::fs::read_dir(&staged)? {
        let entry = entry?;
        std::fs::rename(entry.path(), dest.join(entry.file_name()))?;
    }
    std::fs::remove_dir(&staged)?;
    warn_if_still_nested(dest);
    Ok(())
}

fn warn_if_still_nested(dest: &Path) {
    // A doubly-nested archive is rare enough to only note
    if let Ok(entries) = std::fs::read_dir(dest) {
        let all: Vec<_> = entries.flatten().collect();
        if all.len() == 1 && all[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
            debug!(
                "Source root {} still holds a single directory after flattening",
                dest.display()
            );
        }
    }
}
