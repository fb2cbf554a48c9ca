// kiln-common/src/keg.rs
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{KilnError, Result};
use super::model::source::SourceReference;

const INDEX_FORMAT_VERSION: u32 = 1;

/// A verified installation recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledKeg {
    pub name: String,
    pub version: String,
    pub source: SourceReference,
    pub prefix: PathBuf,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    format: u32,
    #[serde(default)]
    formulae: BTreeMap<String, InstalledKeg>,
}

/// The set of installed formulae, shared between concurrent install attempts.
///
/// Reads go through an `RwLock`. `mark_installed` is serialised by a separate
/// mutex and persists the new state before publishing it, so readers never see
/// an entry that is not on disk.
#[derive(Debug)]
pub struct InstalledIndex {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, InstalledKeg>>,
    write_lock: Mutex<()>,
    in_flight: Mutex<HashSet<String>>,
}

impl InstalledIndex {
    /// Loads the index file. A missing file is an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                let file: IndexFile = serde_json::from_slice(&bytes).map_err(|e| {
                    KilnError::ParseError(
                        "installed index",
                        format!("{}: {e}", path.display()),
                    )
                })?;
                if file.format > INDEX_FORMAT_VERSION {
                    warn!(
                        "Installed index {} has newer format {}, reading anyway",
                        path.display(),
                        file.format
                    );
                }
                file.formulae
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No installed index at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::with_entries(Some(path), entries))
    }

    /// An index that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_entries(None, BTreeMap::new())
    }

    fn with_entries(path: Option<PathBuf>, entries: BTreeMap<String, InstalledKeg>) -> Self {
        Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<InstalledKeg> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, InstalledKeg> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims `name` for one install attempt. `None` when another attempt holds it.
    pub fn try_claim(&self, name: &str) -> Option<InstallClaim<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(name.to_string()) {
            return None;
        }
        Some(InstallClaim {
            index: self,
            name: name.to_string(),
        })
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Records a verified install, replacing any previous entry of the same name.
    pub fn mark_installed(&self, keg: InstalledKeg) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next = self.snapshot();
        debug!("Recording {} {} in installed index", keg.name, keg.version);
        next.insert(keg.name.clone(), keg);

        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }
}

impl InstalledIndex {
    /// Whether the index file still holds exactly what this index last wrote or read.
    ///
    /// An in-memory index always matches. A missing or unparsable file does not.
    pub fn matches_disk(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(true);
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let on_disk = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(file) => file.formulae,
                Err(e) => {
                    warn!("Installed index {} is unreadable: {}", path.display(), e);
                    return Ok(false);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.is_empty());
            }
            Err(e) => return Err(e.into()),
        };
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(*entries == on_disk)
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, InstalledKeg>) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        KilnError::Generic(format!("Index path {} has no parent", path.display()))
    })?;
    fs::create_dir_all(parent)?;

    let file = IndexFile {
        format: INDEX_FORMAT_VERSION,
        formulae: entries.clone(),
    };
    let json = serde_json::to_vec_pretty(&file)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| KilnError::Io(std::sync::Arc::new(e.error)))?;
    Ok(())
}

/// Exclusive right to install one formula. Released on drop.
#[derive(Debug)]
pub struct InstallClaim<'a> {
    index: &'a InstalledIndex,
    name: String,
}

impl InstallClaim<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for InstallClaim<'_> {
    fn drop(&mut self) {
        self.index
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    fn keg(name: &str) -> InstalledKeg {
        InstalledKeg {
            name: name.to_string(),
            version: "HEAD-abcdef0".to_string(),
            source: SourceReference::Commit("abcdef0123456789".to_string()),
            prefix: PathBuf::from(format!("/k/Cellar/{name}/HEAD-abcdef0")),
            installed_at: Utc::now(),
            runtime_dependencies: Vec::new(),
        }
    }

    #[test]
    fn foreign_writes_to_the_index_file_are_noticed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        let index = InstalledIndex::load(&path).unwrap();
        assert!(index.matches_disk().unwrap());

        index.mark_installed(keg("dvd")).unwrap();
        assert!(index.matches_disk().unwrap());

        InstalledIndex::load(&path)
            .unwrap()
            .mark_installed(keg("go"))
            .unwrap();
        assert!(!index.matches_disk().unwrap());

        fs::write(&path, "not json").unwrap();
        assert!(!index.matches_disk().unwrap());
        assert!(InstalledIndex::in_memory().matches_disk().unwrap());
    }

    #[test]
    fn missing_file_loads_empty_and_persists_on_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("var/kiln/installed.json");
        let index = InstalledIndex::load(&path).unwrap();
        assert!(index.is_empty());

        index.mark_installed(keg("dvd")).unwrap();
        assert!(index.contains("dvd"));

        let reloaded = InstalledIndex::load(&path).unwrap();
        assert_eq!(reloaded.get("dvd"), index.get("dvd"));
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let index = InstalledIndex::in_memory();
        let claim = index.try_claim("dvd").unwrap();
        assert!(index.try_claim("dvd").is_none());
        assert!(index.try_claim("go").is_some());
        drop(claim);
        assert!(!index.is_claimed("dvd"));
        assert!(index.try_claim("dvd").is_some());
    }

    #[test]
    fn concurrent_marks_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        let index = Arc::new(InstalledIndex::load(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = Arc::clone(&index);
                thread::spawn(move || index.mark_installed(keg(&format!("f{i}"))).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len(), 8);
        assert_eq!(InstalledIndex::load(&path).unwrap().len(), 8);
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            InstalledIndex::load(&path),
            Err(KilnError::ParseError(..))
        ));
    }
}
