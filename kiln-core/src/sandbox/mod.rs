// kiln-core/src/sandbox/mod.rs
//! Per-attempt build sandbox.
//!
//! A sandbox is a private directory under `<root>/tmp` holding the source tree and
//! a throwaway `HOME` and `TMPDIR`. It is released exactly once: explicitly through
//! `teardown`, or by `Drop` when the attempt is cancelled or unwinds.
pub mod confinement;
pub mod env;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::dependency::ResolvedPlan;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::Formula;
use kiln_common::pipeline::PipelineEvent;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use confinement::{AuditSnapshot, Confinement, PathAudit};

use crate::build::substitute::Substitutions;
use crate::source::{AcquiredSource, SOURCE_DIR_NAME};

#[derive(Debug)]
pub struct BuildSandbox {
    formula: String,
    root: PathBuf,
    dir: Option<TempDir>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl BuildSandbox {
    /// Creates `<root>/tmp/<name>-XXXXXX` with `home/` and `tmp/` inside.
    pub fn allocate(
        config: &Config,
        formula: &str,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Result<Self> {
        let parent = config.tmp_dir();
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{formula}-"))
            .tempdir_in(&parent)
            .map_err(|e| {
                KilnError::BuildEnvError(format!(
                    "Failed to allocate sandbox in {}: {e}",
                    parent.display()
                ))
            })?;
        for sub in ["home", "tmp"] {
            std::fs::create_dir_all(dir.path().join(sub))?;
        }
        debug!("Allocated sandbox {} for {}", dir.path().display(), formula);
        Ok(Self {
            formula: formula.to_string(),
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            event_tx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join(SOURCE_DIR_NAME)
    }

    /// Builds the context for running the recipe against `prefix`.
    ///
    /// Every declared dependency must have a resolved path in `plan`.
    pub fn prepare(
        &self,
        config: &Config,
        plan: &ResolvedPlan,
        formula: &Formula,
        source: &AcquiredSource,
        prefix: &Path,
    ) -> Result<BuildContext> {
        let version = prefix
            .file_name()
            .map(|v| v.to_string_lossy().into_owned())
            .ok_or_else(|| {
                KilnError::BuildEnvError(format!("Invalid keg prefix {}", prefix.display()))
            })?;

        let mut dependencies = BTreeMap::new();
        for dep in formula.dependencies() {
            let path = plan.dependency_path(&dep.name).ok_or_else(|| {
                KilnError::UnresolvedDependency {
                    formula: formula.name.clone(),
                    dependency: dep.name.clone(),
                    reason: "no installed prefix".to_string(),
                }
            })?;
            dependencies.insert(dep.name.clone(), path.to_path_buf());
        }

        let mut library_dependencies = plan.build_dependency_paths.clone();
        for entry in &plan.runtime_dependency_paths {
            if !library_dependencies.contains(entry) {
                library_dependencies.push(entry.clone());
            }
        }

        let home = self.root.join("home");
        let tmp = self.root.join("tmp");
        let env = env::build_env(&env::EnvSpec {
            formula: &formula.name,
            prefix,
            home: &home,
            tmp: &tmp,
            path_dependencies: &plan.build_dependency_paths,
            library_dependencies: &library_dependencies,
            base_path: &config.base_path,
        });

        let substitutions = Substitutions::new(
            formula.name.clone(),
            version.clone(),
            prefix,
            config.kiln_root(),
            &source.dir,
            dependencies,
        );

        Ok(BuildContext {
            formula: formula.name.clone(),
            version,
            prefix: prefix.to_path_buf(),
            work_dir: self.root.clone(),
            source_dir: source.dir.clone(),
            build_dependency_paths: plan.build_dependency_paths.clone(),
            runtime_dependency_paths: plan.runtime_dependency_paths.clone(),
            base_path: config.base_path.clone(),
            env,
            substitutions,
        })
    }

    /// Removes the sandbox directory and reports it.
    pub fn teardown(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        debug!("Tearing down sandbox {}", self.root.display());
        let result = dir.close().map_err(|e| {
            warn!("Failed to remove sandbox {}: {}", self.root.display(), e);
            KilnError::from(e)
        });
        let _ = self.event_tx.send(PipelineEvent::SandboxTornDown {
            target_id: self.formula.clone(),
        });
        result
    }
}

impl Drop for BuildSandbox {
    fn drop(&mut self) {
        if self.dir.is_some() {
            debug!("Sandbox for {} released on drop", self.formula);
            let _ = self.release();
        }
    }
}

/// Everything the executor and verifier need for one attempt.
#[derive(Debug, Clone)]
pub struct BuildContext {
    formula: String,
    version: String,
    prefix: PathBuf,
    work_dir: PathBuf,
    source_dir: PathBuf,
    build_dependency_paths: Vec<(String, PathBuf)>,
    runtime_dependency_paths: Vec<(String, PathBuf)>,
    base_path: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    substitutions: Substitutions,
}

impl BuildContext {
    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn build_dependency_paths(&self) -> &[(String, PathBuf)] {
        &self.build_dependency_paths
    }

    /// Build and run-time dependency prefixes, without duplicates.
    pub fn dependency_paths(&self) -> impl Iterator<Item = &(String, PathBuf)> {
        let build = &self.build_dependency_paths;
        build.iter().chain(
            self.runtime_dependency_paths
                .iter()
                .filter(move |entry| !build.contains(entry)),
        )
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn substitutions(&self) -> &Substitutions {
        &self.substitutions
    }

    /// Environment for the test recipe: the installed `bin` and run-time dependencies
    /// on PATH instead of build dependencies.
    pub fn test_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.env.clone();
        let mut dirs = vec![self.prefix.join("bin")];
        dirs.extend(env::path_dirs(&self.runtime_dependency_paths, &self.base_path));
        vars.insert(
            "PATH".to_string(),
            kiln_common::config::join_paths_lossy(&dirs),
        );
        vars
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_common::dependency::{DependencyTag, ResolutionStatus, ResolvedDependency};
    use kiln_common::keg::{InstalledIndex, InstalledKeg};
    use kiln_common::model::source::SourceReference;
    use pretty_assertions::assert_eq;

    use super::*;

    const DVD: &str = r#"
name = "dvd"
dependencies = [{ name = "go", phase = "build" }]

[source]
kind = "head"
url = "https://example.com/dvd.git"
"#;

    fn plan_with_go(go: &Path) -> ResolvedPlan {
        ResolvedPlan {
            target: "dvd".into(),
            activation_order: vec![ResolvedDependency {
                name: "go".into(),
                formula: None,
                status: ResolutionStatus::Installed,
                accumulated_tags: DependencyTag::BUILD,
                path: Some(go.to_path_buf()),
                requires: Vec::new(),
            }],
            build_dependency_paths: vec![("go".into(), go.to_path_buf())],
            runtime_dependency_paths: Vec::new(),
        }
    }

    fn setup() -> (tempfile::TempDir, Config, BuildSandbox, BuildContext) {
        let root = tempfile::tempdir().unwrap();
        let config = Config::for_root(root.path());
        config.ensure_layout().unwrap();
        let go = config.formula_keg_path("go", "1.22");
        std::fs::create_dir_all(go.join("bin")).unwrap();
        std::fs::write(go.join("bin/go"), "#!/bin/sh\n").unwrap();

        let (tx, _) = broadcast::channel(16);
        let sandbox = BuildSandbox::allocate(&config, "dvd", tx).unwrap();
        std::fs::create_dir_all(sandbox.source_dir()).unwrap();
        let source = AcquiredSource {
            dir: sandbox.source_dir(),
            reference: SourceReference::Commit("abcdef0123".into()),
        };
        let formula = Formula::from_toml_str(DVD).unwrap();
        let prefix = config.formula_keg_path("dvd", "HEAD-abcdef0");
        std::fs::create_dir_all(&prefix).unwrap();
        let context = sandbox
            .prepare(&config, &plan_with_go(&go), &formula, &source, &prefix)
            .unwrap();
        (root, config, sandbox, context)
    }

    #[test]
    fn context_exposes_build_dependencies_and_sandbox_home() {
        let (_root, config, sandbox, context) = setup();
        let go_bin = config.formula_keg_path("go", "1.22").join("bin");

        assert_eq!(context.version(), "HEAD-abcdef0");
        assert!(context.env()["PATH"].starts_with(&go_bin.display().to_string()));
        assert_eq!(
            context.env()["HOME"],
            sandbox.root().join("home").display().to_string()
        );
        assert_eq!(
            context.substitutions().expand_str("{dep:go}").unwrap(),
            config.formula_keg_path("go", "1.22").display().to_string()
        );
        assert!(!context.test_env()["PATH"].contains(&go_bin.display().to_string()));
    }

    #[test]
    fn teardown_removes_the_directory_and_reports_once() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::for_root(root.path());
        let (tx, mut rx) = broadcast::channel(16);

        let sandbox = BuildSandbox::allocate(&config, "dvd", tx.clone()).unwrap();
        let dir = sandbox.root().to_path_buf();
        assert!(dir.join("home").is_dir());
        sandbox.teardown().unwrap();
        assert!(!dir.exists());

        let dropped = BuildSandbox::allocate(&config, "dvd", tx).unwrap();
        let dropped_dir = dropped.root().to_path_buf();
        drop(dropped);
        assert!(!dropped_dir.exists());

        let mut torn_down = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PipelineEvent::SandboxTornDown { .. }) {
                torn_down += 1;
            }
        }
        assert_eq!(torn_down, 2);
    }

    #[test]
    fn audit_accepts_writes_to_the_prefix_only() {
        let (_root, config, _sandbox, context) = setup();
        let audit = PathAudit::new(&config);

        let before = audit.begin(&context).unwrap();
        std::fs::create_dir_all(context.prefix().join("bin")).unwrap();
        std::fs::write(context.prefix().join("bin/dvd"), "binary").unwrap();
        audit.audit(&context, before).unwrap();

        let before = audit.begin(&context).unwrap();
        std::fs::write(config.formula_keg_path("go", "1.22").join("bin/gofmt"), "x").unwrap();
        let err = audit.audit(&context, before).unwrap_err();
        assert!(matches!(err, KilnError::SandboxViolation(ref m) if m.contains("gofmt")));

        let before = audit.begin(&context).unwrap();
        std::fs::write(config.kiln_root().join("stray.txt"), "x").unwrap();
        assert!(matches!(
            audit.audit(&context, before),
            Err(KilnError::SandboxViolation(_))
        ));
    }

    #[test]
    fn audit_guards_the_index_and_link_directories() {
        let (_root, config, _sandbox, context) = setup();
        let index = Arc::new(InstalledIndex::load(config.installed_index_path()).unwrap());
        let audit = PathAudit::new(&config).with_index(Arc::clone(&index));
        let go = config.formula_keg_path("go", "1.22");

        // Sibling attempts finishing mid-build are not violations.
        let before = audit.begin(&context).unwrap();
        index
            .mark_installed(InstalledKeg {
                name: "go".into(),
                version: "1.22".into(),
                source: SourceReference::Sha256("0".repeat(64)),
                prefix: go.clone(),
                installed_at: chrono::Utc::now(),
                runtime_dependencies: Vec::new(),
            })
            .unwrap();
        std::os::unix::fs::symlink(&go, config.opt_dir().join("go")).unwrap();
        std::os::unix::fs::symlink(go.join("bin/go"), config.bin_dir().join("go")).unwrap();
        audit.audit(&context, before).unwrap();

        let before = audit.begin(&context).unwrap();
        std::fs::write(config.installed_index_path(), "{}").unwrap();
        let err = audit.audit(&context, before).unwrap_err();
        assert!(matches!(err, KilnError::SandboxViolation(ref m) if m.contains("installed.json")));

        let index = Arc::new(InstalledIndex::load(config.installed_index_path()).unwrap());
        let audit = PathAudit::new(&config).with_index(index);
        let before = audit.begin(&context).unwrap();
        std::fs::write(config.bin_dir().join("dvd"), "binary").unwrap();
        std::fs::remove_file(config.bin_dir().join("go")).unwrap();
        std::os::unix::fs::symlink("/usr/bin/env", config.bin_dir().join("go")).unwrap();
        let err = audit.audit(&context, before).unwrap_err();
        assert!(
            matches!(err, KilnError::SandboxViolation(ref m) if m.contains("created") && m.contains("modified")),
            "{err:?}"
        );
    }
}
