// kiln-core/src/sandbox/confinement.rs
//! Confinement of build steps.
//!
//! The OS-level isolation primitive is pluggable. What ships here is `PathAudit`,
//! which does not prevent writes but detects them: it snapshots the locations a
//! build must not touch and compares them once the recipe has run.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use kiln_aio::process::CommandSpec;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::InstalledIndex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::BuildContext;

/// Number of offending paths named in a `SandboxViolation`.
const REPORTED_PATHS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryStamp {
    kind: EntryKind,
    len: u64,
    modified: Option<SystemTime>,
    target: Option<PathBuf>,
}

/// State captured before the build, handed back to `audit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSnapshot {
    entries: BTreeMap<PathBuf, EntryStamp>,
}

impl AuditSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait Confinement: Send + Sync + fmt::Debug {
    /// Adjusts a step's command before it is spawned.
    fn wrap(&self, spec: CommandSpec) -> CommandSpec {
        spec
    }

    /// Called after the context is prepared and before the first step runs.
    fn begin(&self, _context: &BuildContext) -> Result<AuditSnapshot> {
        Ok(AuditSnapshot::default())
    }

    /// Fails with `SandboxViolation` if the build reached outside its prefix.
    fn audit(&self, _context: &BuildContext, _before: AuditSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Detects writes to the kiln root's top level, to `bin/` and `opt/`, to sibling
/// kegs of the formula, to dependency prefixes and to the installed index.
///
/// Concurrent attempts link into `bin/` and `opt/` while a build runs, so new or
/// re-pointed symlinks into the cellar are accepted there.
#[derive(Debug, Clone)]
pub struct PathAudit {
    root: PathBuf,
    cellar: PathBuf,
    link_dirs: [PathBuf; 2],
    index: Option<Arc<InstalledIndex>>,
}

impl PathAudit {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.kiln_root().to_path_buf(),
            cellar: config.cellar_dir(),
            link_dirs: [config.bin_dir(), config.opt_dir()],
            index: None,
        }
    }

    /// Also fails the audit when the index file no longer matches `index`.
    pub fn with_index(mut self, index: Arc<InstalledIndex>) -> Self {
        self.index = Some(index);
        self
    }

    fn snapshot(&self, context: &BuildContext) -> AuditSnapshot {
        let mut entries = BTreeMap::new();
        // Only names at the top level; the directories below change with every install.
        record_tree(&self.root, 1, None, &mut entries, true);
        for dir in &self.link_dirs {
            record_tree(dir, 1, None, &mut entries, false);
        }

        let cellar = context.prefix().parent().map(Path::to_path_buf);
        if let Some(cellar) = cellar {
            record_tree(&cellar, usize::MAX, Some(context.prefix()), &mut entries, false);
        }
        for (_, dep) in context.dependency_paths() {
            record_tree(dep, usize::MAX, None, &mut entries, false);
        }
        AuditSnapshot { entries }
    }
}

impl Confinement for PathAudit {
    fn begin(&self, context: &BuildContext) -> Result<AuditSnapshot> {
        let snapshot = self.snapshot(context);
        debug!(
            "Confinement snapshot for {} holds {} entries",
            context.formula(),
            snapshot.len()
        );
        Ok(snapshot)
    }

    fn audit(&self, context: &BuildContext, before: AuditSnapshot) -> Result<()> {
        let after = self.snapshot(context);
        let mut changed: Vec<String> = Vec::new();
        for (path, stamp) in &before.entries {
            match after.entries.get(path) {
                None => changed.push(format!("removed {}", path.display())),
                Some(now) if now != stamp && !self.is_kiln_link(path, now) => {
                    changed.push(format!("modified {}", path.display()))
                }
                Some(_) => {}
            }
        }
        for (path, stamp) in &after.entries {
            if !before.entries.contains_key(path) && !self.is_kiln_link(path, stamp) {
                changed.push(format!("created {}", path.display()));
            }
        }
        if let Some(index) = &self.index {
            if !index.matches_disk()? {
                let path = index.path().map(Path::to_path_buf).unwrap_or_default();
                changed.push(format!("modified {}", path.display()));
            }
        }

        if changed.is_empty() {
            return Ok(());
        }
        warn!(
            "Build of {} touched {} guarded path(s)",
            context.formula(),
            changed.len()
        );
        let more = changed.len().saturating_sub(REPORTED_PATHS);
        changed.truncate(REPORTED_PATHS);
        let mut message = changed.join(", ");
        if more > 0 {
            message.push_str(&format!(" and {more} more"));
        }
        Err(KilnError::SandboxViolation(format!(
            "{} wrote outside its prefix: {message}",
            context.formula()
        )))
    }
}

impl PathAudit {
    /// A symlink in `bin/` or `opt/` that points into the cellar, as linking creates.
    fn is_kiln_link(&self, path: &Path, stamp: &EntryStamp) -> bool {
        let in_link_dir = path
            .parent()
            .is_some_and(|parent| self.link_dirs.iter().any(|dir| dir == parent));
        in_link_dir
            && stamp.kind == EntryKind::Symlink
            && stamp
                .target
                .as_ref()
                .is_some_and(|target| target.starts_with(&self.cellar))
    }
}

fn record_tree(
    root: &Path,
    max_depth: usize,
    skip: Option<&Path>,
    entries: &mut BTreeMap<PathBuf, EntryStamp>,
    names_only: bool,
) {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !matches!(skip, Some(skip) if e.path().starts_with(skip)));
    for entry in walker.filter_map(|e| e.ok()) {
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        let stamp = match (names_only, kind, entry.metadata()) {
            (false, EntryKind::File, Ok(meta)) => EntryStamp {
                kind,
                len: meta.len(),
                modified: meta.modified().ok(),
                target: None,
            },
            (false, EntryKind::Symlink, _) => EntryStamp {
                kind,
                len: 0,
                modified: None,
                target: std::fs::read_link(entry.path()).ok(),
            },
            _ => EntryStamp {
                kind,
                len: 0,
                modified: None,
                target: None,
            },
        };
        entries.insert(entry.into_path(), stamp);
    }
}
