// kiln-core/src/test_support.rs
//! Fixtures shared by the unit tests of this crate.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::dependency::ResolvedPlan;
use kiln_common::model::source::SourceReference;
use kiln_common::model::Formula;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::sandbox::{BuildContext, BuildSandbox};
use crate::source::AcquiredSource;

pub const DEMO: &str = r#"
name = "demo"
version = "1.0"

[source]
kind = "archive"
url = "https://example.com/demo-1.0.tar.gz"
sha256 = "0000000000000000000000000000000000000000000000000000000000000000"
"#;

/// Writes an executable `/bin/sh` script.
pub fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Configuration rooted in `root` whose sandbox PATH starts with `tools`.
pub fn config_with_tools(root: &Path, tools: &Path) -> Config {
    let mut config = Config::for_root(root);
    config.base_path = vec![
        tools.to_path_buf(),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/bin"),
    ];
    config.fetch.max_attempts = 2;
    config.fetch.initial_backoff = std::time::Duration::from_millis(1);
    config.fetch.max_backoff = std::time::Duration::from_millis(2);
    config.ensure_layout().unwrap();
    config
}

pub struct Fixture {
    pub _root: TempDir,
    pub tools: PathBuf,
    pub config: Config,
    pub _sandbox: BuildSandbox,
    pub context: BuildContext,
}

/// A prepared context for the dependency-free `demo` formula.
pub fn fixture(version: &str) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let tools = root.path().join("tools");
    std::fs::create_dir_all(&tools).unwrap();
    let config = config_with_tools(&root.path().join("kiln"), &tools);

    let (tx, _) = broadcast::channel(16);
    let sandbox = BuildSandbox::allocate(&config, "demo", tx).unwrap();
    std::fs::create_dir_all(sandbox.source_dir()).unwrap();
    let source = AcquiredSource {
        dir: sandbox.source_dir(),
        reference: SourceReference::Sha256("0".repeat(64)),
    };
    let formula = Formula::from_toml_str(DEMO).unwrap();
    let plan = ResolvedPlan {
        target: "demo".into(),
        activation_order: Vec::new(),
        build_dependency_paths: Vec::new(),
        runtime_dependency_paths: Vec::new(),
    };
    let prefix = config.formula_keg_path("demo", version);
    let context = sandbox
        .prepare(&config, &plan, &formula, &source, &prefix)
        .unwrap();
    Fixture {
        _root: root,
        tools,
        config,
        _sandbox: sandbox,
        context,
    }
}

/// Creates a repository on branch `main` with one commit holding `files`.
pub fn init_repo(dir: &Path, files: &[(&str, &str)]) -> String {
    kiln_aio::git2::test_support::init_repo(dir, &[files]).remove(0)
}
