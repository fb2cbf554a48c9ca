// kiln-core/src/build/link.rs
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_aio::fs::{is_executable, replace_symlink};
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::source::SourceReference;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Written into the keg once it is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub source: SourceReference,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    #[serde(default)]
    pub links: Vec<PathBuf>,
}

#[derive(Debug)]
struct CreatedLink {
    path: PathBuf,
    previous: Option<PathBuf>,
}

/// Links created for one keg.
///
/// Until [`KegLinks::commit`] is called, dropping the value removes every link it
/// created and points replaced links back at their previous targets.
#[derive(Debug, Default)]
pub struct KegLinks {
    created: Vec<CreatedLink>,
    committed: bool,
}

impl KegLinks {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.created.iter().map(|l| l.path.clone()).collect()
    }

    fn link(&mut self, target: &Path, link: &Path) -> Result<()> {
        let previous = match fs::symlink_metadata(link) {
            Ok(meta) if meta.file_type().is_symlink() => Some(fs::read_link(link)?),
            Ok(_) => {
                return Err(KilnError::InstallError(format!(
                    "{} exists and is not a symlink",
                    link.display()
                )))
            }
            Err(_) => None,
        };
        replace_symlink(target, link)?;
        self.created.push(CreatedLink {
            path: link.to_path_buf(),
            previous,
        });
        Ok(())
    }

    /// Keeps the links in place.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        for link in self.created.drain(..).rev() {
            let restored = match &link.previous {
                Some(target) => replace_symlink(target, &link.path),
                None => fs::remove_file(&link.path).map_err(KilnError::from),
            };
            match restored {
                Ok(()) => debug!("Rolled back link {}", link.path.display()),
                Err(e) => warn!("Failed to roll back {}: {}", link.path.display(), e),
            }
        }
    }
}

impl Drop for KegLinks {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

/// Points `<root>/opt/<name>` at the keg and links its executables into `<root>/bin`.
///
/// All or nothing: on error the links made so far are undone before returning.
pub fn link_keg(config: &Config, formula_name: &str, keg: &Path) -> Result<KegLinks> {
    debug!("Linking {} from {}", formula_name, keg.display());
    let mut links = KegLinks::default();

    links.link(keg, &config.formula_opt_path(formula_name))?;

    let keg_bin = keg.join("bin");
    if keg_bin.is_dir() {
        let target_bin = config.bin_dir();
        fs::create_dir_all(&target_bin)?;
        for entry in fs::read_dir(&keg_bin)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if file_name.to_string_lossy().starts_with('.') {
                continue;
            }
            let source = entry.path();
            if !source.is_file() || !is_executable(&source) {
                debug!("Skipping non-executable {}", source.display());
                continue;
            }
            let link = target_bin.join(&file_name);
            if let Ok(existing) = fs::read_link(&link) {
                if !existing.starts_with(config.formula_cellar_dir(formula_name)) {
                    warn!(
                        "Replacing {} which pointed at {}",
                        link.display(),
                        existing.display()
                    );
                }
            }
            links.link(&source, &link)?;
        }
    }
    Ok(links)
}

/// Absolute path of the receipt inside `keg`.
pub fn receipt_path(keg: &Path) -> PathBuf {
    keg.join(RECEIPT_FILE)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn links_opt_and_executables_only() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::for_root(root.path());
        let keg = config.formula_keg_path("dvd", "1.0");
        fs::create_dir_all(keg.join("bin")).unwrap();
        fs::write(keg.join("bin/dvd"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(keg.join("bin/dvd"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(keg.join("bin/README"), "docs").unwrap();

        let links = link_keg(&config, "dvd", &keg).unwrap();

        assert_eq!(
            links.paths(),
            vec![config.formula_opt_path("dvd"), config.bin_dir().join("dvd")]
        );
        links.commit();
        assert_eq!(fs::read_link(config.formula_opt_path("dvd")).unwrap(), keg);
        assert_eq!(
            fs::read_link(config.bin_dir().join("dvd")).unwrap(),
            keg.join("bin/dvd")
        );
        assert!(!config.bin_dir().join("README").exists());

        // Relinking a newer keg replaces the links.
        let newer = config.formula_keg_path("dvd", "1.1");
        fs::create_dir_all(&newer).unwrap();
        link_keg(&config, "dvd", &newer).unwrap().commit();
        assert_eq!(fs::read_link(config.formula_opt_path("dvd")).unwrap(), newer);
    }

    #[test]
    fn uncommitted_links_restore_previous_targets() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::for_root(root.path());
        let old = config.formula_keg_path("dvd", "1.0");
        fs::create_dir_all(old.join("bin")).unwrap();
        link_keg(&config, "dvd", &old).unwrap().commit();

        let keg = config.formula_keg_path("dvd", "1.1");
        fs::create_dir_all(keg.join("bin")).unwrap();
        fs::write(keg.join("bin/dvd"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(keg.join("bin/dvd"), fs::Permissions::from_mode(0o755)).unwrap();

        let links = link_keg(&config, "dvd", &keg).unwrap();
        assert_eq!(fs::read_link(config.formula_opt_path("dvd")).unwrap(), keg);
        drop(links);

        assert_eq!(fs::read_link(config.formula_opt_path("dvd")).unwrap(), old);
        assert!(config.bin_dir().join("dvd").symlink_metadata().is_err());
    }

    #[test]
    fn failure_part_way_leaves_no_links() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::for_root(root.path());
        let keg = config.formula_keg_path("dvd", "1.0");
        fs::create_dir_all(keg.join("bin")).unwrap();
        fs::write(keg.join("bin/dvd"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(keg.join("bin/dvd"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir_all(config.bin_dir()).unwrap();
        fs::write(config.bin_dir().join("dvd"), "not ours").unwrap();

        assert!(link_keg(&config, "dvd", &keg).is_err());

        assert!(config.formula_opt_path("dvd").symlink_metadata().is_err());
        assert_eq!(
            fs::read_to_string(config.bin_dir().join("dvd")).unwrap(),
            "not ours"
        );
    }
}
