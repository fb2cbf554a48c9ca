// kiln-aio/src/extract.rs
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tracing::{debug, error};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    TarXz,
    Tar,
    Zip,
}

impl ArchiveKind {
    /// Detects the archive type from the file name, falling back to the file's magic bytes.
    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(kind) = Self::from_file_name(path) {
            return Ok(kind);
        }
        let sniffed = infer::get_from_path(path)?;
        let kind = match sniffed.map(|t| t.mime_type()) {
            Some("application/gzip") => Some(Self::TarGz),
            Some("application/x-bzip2") => Some(Self::TarBz2),
            Some("application/x-xz") => Some(Self::TarXz),
            Some("application/x-tar") => Some(Self::Tar),
            Some("application/zip") => Some(Self::Zip),
            _ => None,
        };
        debug!("Sniffed archive type of {}: {:?}", path.display(), kind);
        kind.ok_or_else(|| {
            KilnError::Generic(format!(
                "Unsupported archive type for {}",
                path.display()
            ))
        })
    }

    fn from_file_name(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if [".tar.bz2", ".tbz", ".tbz2"].iter().any(|ext| name.ends_with(ext)) {
            Self::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Extracts an archive into `target_dir`, stripping leading path components.
pub async fn extract_archive_async(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        extract_archive(&archive_path, &target_dir, strip_components)
    })
    .await
    .map_err(|e| KilnError::Generic(format!("JoinError in archive extraction: {e}")))?
}

pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    let kind = ArchiveKind::detect(archive_path)?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );
    fs::create_dir_all(target_dir)?;

    let file = BufReader::new(File::open(archive_path)?);
    match kind {
        ArchiveKind::TarGz => {
            extract_tar(GzDecoder::new(file), target_dir, strip_components, archive_path)
        }
        ArchiveKind::TarBz2 => {
            extract_tar(BzDecoder::new(file), target_dir, strip_components, archive_path)
        }
        ArchiveKind::TarXz => {
            extract_tar(XzDecoder::new(file), target_dir, strip_components, archive_path)
        }
        ArchiveKind::Tar => extract_tar(file, target_dir, strip_components, archive_path),
        ArchiveKind::Zip => {
            extract_zip(file.into_inner(), target_dir, strip_components, archive_path)
        }
    }
}

/// Maps an archive member path below `target_dir`. `None` for members consumed by stripping.
fn stripped_target(
    target_dir: &Path,
    member: &Path,
    strip_components: usize,
    archive_path: &Path,
) -> Result<Option<PathBuf>> {
    let stripped: Vec<_> = member.components().skip(strip_components).collect();
    if stripped.is_empty() {
        return Ok(None);
    }
    let mut target_path = target_dir.to_path_buf();
    for comp in stripped {
        match comp {
            Component::Normal(p) => target_path.push(p),
            Component::CurDir => {}
            _ => {
                error!(
                    "Disallowed component {:?} in member {} of {}",
                    comp,
                    member.display(),
                    archive_path.display()
                );
                return Err(KilnError::Generic(format!(
                    "Unsafe path component in {} of {}",
                    member.display(),
                    archive_path.display()
                )));
            }
        }
    }
    Ok(Some(target_path))
}

fn extract_tar<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path: &Path,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| {
        KilnError::Generic(format!("Failed to read {}: {e}", archive_path.display()))
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| {
            KilnError::Generic(format!(
                "Error reading TAR entry from {}: {e}",
                archive_path.display()
            ))
        })?;
        let member = entry
            .path()
            .map_err(|e| {
                KilnError::Generic(format!(
                    "Invalid path in TAR entry from {}: {e}",
                    archive_path.display()
                ))
            })?
            .into_owned();
        let target = stripped_target(target_dir, &member, strip_components, archive_path)?;
        let Some(target_path) = target else {
            continue;
        };
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target_path).map_err(|e| {
            KilnError::Generic(format!(
                "Failed to unpack TAR entry {}: {e}",
                member.display()
            ))
        })?;
    }
    Ok(())
}

fn extract_zip(
    file: File,
    target_dir: &Path,
    strip_components: usize,
    archive_path: &Path,
) -> Result<()> {
    let mut archive = ZipArchive::new(file).map_err(|e| {
        KilnError::Generic(format!("Failed to open ZIP {}: {e}", archive_path.display()))
    })?;
    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .map_err(|e| KilnError::Generic(format!("Failed to access ZIP entry: {e}")))?;
        let name = member.enclosed_name().ok_or_else(|| {
            KilnError::Generic(format!(
                "Invalid ZIP entry path '{}' in {}",
                member.name(),
                archive_path.display()
            ))
        })?;
        let target = stripped_target(target_dir, &name, strip_components, archive_path)?;
        let Some(target_path) = target else {
            continue;
        };
        if member.is_dir() {
            fs::create_dir_all(&target_path)?;
            continue;
        }
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target_path)?;
        std::io::copy(&mut member, &mut outfile)?;
        if let Some(mode) = member.unix_mode() {
            crate::fs::set_permissions(&target_path, mode & 0o777)?;
        }
    }
    Ok(())
}

/// The directory to use as source root: the only top-level directory if there is
/// exactly one entry and it is a directory, otherwise `dir` itself.
pub fn single_top_level_dir(dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(only) = entries.pop() {
            return Ok(only.path());
        }
    }
    Ok(dir.to_path_buf())
}
