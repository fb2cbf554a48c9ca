// kiln-aio/src/fs.rs
//! Filesystem primitives shared by the acquirer, sandbox and linker.
use std::fs::{self, Permissions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Removes a directory tree. A missing directory is not an error.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed directory {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("Failed remove dir_all {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

pub async fn remove_dir_all_if_exists_async(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || remove_dir_all_if_exists(&path))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError removing directory: {e}")))?
}

/// Moves a fully materialised directory into its final place.
///
/// `from` and `to` must be on the same filesystem. An existing, empty `to` is replaced.
pub fn rename_dir_into_place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.is_dir() && fs::read_dir(to)?.next().is_none() {
        fs::remove_dir(to)?;
    }
    debug!("Renaming {} -> {}", from.display(), to.display());
    fs::rename(from, to).map_err(|e| {
        error!(
            "Failed to move {} into place at {}: {}",
            from.display(),
            to.display(),
            e
        );
        KilnError::from(e)
    })
}

/// Points `link` at `target`, replacing whatever `link` was before.
#[cfg(unix)]
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link.parent().ok_or_else(|| {
        KilnError::Generic(format!("Symlink path {} has no parent", link.display()))
    })?;
    fs::create_dir_all(parent)?;

    let file_name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.kiln-link"));
    if staging.symlink_metadata().is_ok() {
        fs::remove_file(&staging)?;
    }
    symlink(target, &staging)?;
    debug!("Linking {} -> {}", link.display(), target.display());
    fs::rename(&staging, link).map_err(|e| {
        let _ = fs::remove_file(&staging);
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    warn!(
        "Symlink creation not supported on this platform: {} -> {}",
        link.display(),
        target.display()
    );
    Err(KilnError::Generic(
        "Symlinks not supported on this platform".to_string(),
    ))
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn set_permissions(path: &Path, _mode: u32) -> Result<()> {
    warn!(
        "Setting permissions not supported on this platform: {}",
        path.display()
    );
    Ok(())
}

/// Whether `path` is a regular file with any execute bit set.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Atomically writes data to a file using a temporary file in the same directory.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        KilnError::Generic(format!("Cannot get parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| {
        error!(
            "Failed to persist temporary file over {}: {}",
            path.display(),
            e.error
        );
        KilnError::Io(Arc::new(e.error))
    })?;
    if let Err(e) = set_permissions(path, 0o644) {
        warn!("Failed to set permissions on {}: {}", path.display(), e);
    }
    Ok(())
}

pub async fn atomic_write_file_async(path: &Path, content: Vec<u8>) -> Result<()> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write_file(&path, &content))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError writing file: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_replaces_empty_target_only() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join(".staging");
        fs::create_dir(&staged).unwrap();
        fs::write(staged.join("a"), "1").unwrap();
        let target = dir.path().join("final");
        fs::create_dir(&target).unwrap();

        rename_dir_into_place(&staged, &target).unwrap();
        assert!(target.join("a").is_file());
        assert!(!staged.exists());

        let other = dir.path().join(".other");
        fs::create_dir(&other).unwrap();
        assert!(rename_dir_into_place(&other, &target).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_swaps_target() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        fs::create_dir(&v1).unwrap();
        fs::create_dir(&v2).unwrap();
        let link = dir.path().join("opt/dvd");

        replace_symlink(&v1, &link).unwrap();
        replace_symlink(&v2, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), v2);
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tool");
        fs::write(&file, "#!/bin/sh\n").unwrap();
        assert!(!is_executable(&file));
        set_permissions(&file, 0o755).unwrap();
        assert!(is_executable(&file));
        assert!(!is_executable(dir.path()));
        assert!(!is_executable(&dir.path().join("missing")));
    }

    #[test]
    fn missing_directory_removal_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_all_if_exists(&dir.path().join("nope")).unwrap();
    }
}
