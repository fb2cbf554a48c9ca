// kiln-core/src/sandbox/env.rs
//! The environment a build or test step sees. Nothing is inherited from the caller.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::config::join_paths_lossy;
use tracing::debug;

/// Directories and paths an environment is built from.
#[derive(Debug, Clone)]
pub struct EnvSpec<'a> {
    pub formula: &'a str,
    pub prefix: &'a Path,
    pub home: &'a Path,
    pub tmp: &'a Path,
    /// Dependencies whose `bin`/`sbin` go on PATH, in activation order.
    pub path_dependencies: &'a [(String, PathBuf)],
    /// Dependencies searched by pkg-config and cmake.
    pub library_dependencies: &'a [(String, PathBuf)],
    pub base_path: &'a [PathBuf],
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// PATH entries: dependency `bin` and `sbin` directories that exist, then the base path.
pub fn path_dirs(dependencies: &[(String, PathBuf)], base_path: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for (_, prefix) in dependencies {
        for sub in ["bin", "sbin"] {
            let dir = prefix.join(sub);
            if dir.is_dir() {
                push_unique(&mut dirs, dir);
            }
        }
    }
    for dir in base_path {
        push_unique(&mut dirs, dir.clone());
    }
    dirs
}

pub fn build_env(spec: &EnvSpec<'_>) -> BTreeMap<String, String> {
    let lossy = |p: &Path| p.to_string_lossy().into_owned();
    let mut vars = BTreeMap::new();

    let path = path_dirs(spec.path_dependencies, spec.base_path);
    vars.insert("PATH".to_string(), join_paths_lossy(&path));
    vars.insert("HOME".to_string(), lossy(spec.home));
    vars.insert("TMPDIR".to_string(), lossy(spec.tmp));
    vars.insert("XDG_CACHE_HOME".to_string(), lossy(&spec.home.join(".cache")));
    vars.insert("LANG".to_string(), "C".to_string());

    let pkg_config: Vec<PathBuf> = spec
        .library_dependencies
        .iter()
        .flat_map(|(_, p)| [p.join("lib/pkgconfig"), p.join("share/pkgconfig")])
        .filter(|p| p.is_dir())
        .collect();
    if !pkg_config.is_empty() {
        vars.insert("PKG_CONFIG_PATH".to_string(), join_paths_lossy(&pkg_config));
    }
    let cmake: Vec<&Path> = spec
        .library_dependencies
        .iter()
        .map(|(_, p)| p.as_path())
        .collect();
    if !cmake.is_empty() {
        vars.insert("CMAKE_PREFIX_PATH".to_string(), join_paths_lossy(&cmake));
    }

    vars.insert("KILN_PREFIX".to_string(), lossy(spec.prefix));
    vars.insert("KILN_FORMULA".to_string(), spec.formula.to_string());

    debug!(
        "Environment for {}: PATH={}",
        spec.formula,
        vars.get("PATH").map(String::as_str).unwrap_or_default()
    );
    vars
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn path_puts_existing_dependency_bins_before_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let go = dir.path().join("Cellar/go/1.22");
        std::fs::create_dir_all(go.join("bin")).unwrap();
        let ghost = dir.path().join("Cellar/ghost/1.0");
        let base = vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")];

        let deps = vec![("go".to_string(), go.clone()), ("ghost".to_string(), ghost)];
        assert_eq!(
            path_dirs(&deps, &base),
            vec![go.join("bin"), PathBuf::from("/usr/bin"), PathBuf::from("/bin")]
        );
    }

    #[test]
    fn environment_is_rebuilt_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("Cellar/libfoo/2.0");
        std::fs::create_dir_all(lib.join("lib/pkgconfig")).unwrap();
        let deps = vec![("libfoo".to_string(), lib.clone())];
        let prefix = dir.path().join("Cellar/dvd/1.0");
        let home = dir.path().join("sandbox/home");
        let tmp = dir.path().join("sandbox/tmp");

        let env = build_env(&EnvSpec {
            formula: "dvd",
            prefix: &prefix,
            home: &home,
            tmp: &tmp,
            path_dependencies: &[],
            library_dependencies: &deps,
            base_path: &[PathBuf::from("/usr/bin")],
        });

        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["HOME"], home.display().to_string());
        assert_eq!(env["TMPDIR"], tmp.display().to_string());
        assert_eq!(
            env["PKG_CONFIG_PATH"],
            lib.join("lib/pkgconfig").display().to_string()
        );
        assert_eq!(env["CMAKE_PREFIX_PATH"], lib.display().to_string());
        assert_eq!(env["KILN_FORMULA"], "dvd");
        assert!(!env.contains_key("USER"));
    }
}
