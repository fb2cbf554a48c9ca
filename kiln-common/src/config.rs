// kiln-common/src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::UserDirs;
use tracing::debug;

use super::error::{KilnError, Result};

const DEFAULT_ROOT_DIRNAME: &str = ".kiln";
const DEFAULT_BASE_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF: Duration = Duration::from_millis(500);
const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Retry and timeout settings for network operations of the source acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_ATTEMPTS,
            initial_backoff: DEFAULT_FETCH_BACKOFF,
            max_backoff: MAX_FETCH_BACKOFF,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    pub formula_dirs: Vec<PathBuf>,
    /// Toolchain directories every sandbox sees on PATH, after build dependencies.
    pub base_path: Vec<PathBuf>,
    pub fetch: FetchSettings,
    pub max_workers: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration from environment");
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let kiln_root = match var("KILN_ROOT") {
            Some(root) => PathBuf::from(root),
            None => {
                let home = UserDirs::new()
                    .map(|ud| ud.home_dir().to_path_buf())
                    .ok_or_else(|| {
                        KilnError::Config(
                            "KILN_ROOT is not set and no home directory could be determined"
                                .to_string(),
                        )
                    })?;
                debug!("KILN_ROOT not set, defaulting to ~/{DEFAULT_ROOT_DIRNAME}");
                home.join(DEFAULT_ROOT_DIRNAME)
            }
        };
        if !kiln_root.is_absolute() {
            return Err(KilnError::Config(format!(
                "KILN_ROOT must be an absolute path, got '{}'",
                kiln_root.display()
            )));
        }

        let formula_dirs = match var("KILN_FORMULA_PATH") {
            Some(paths) => env::split_paths(&paths).collect(),
            None => vec![kiln_root.join("Formula")],
        };

        let base_path = env::split_paths(&var("KILN_BASE_PATH").unwrap_or_else(|| {
            DEFAULT_BASE_PATH.to_string()
        }))
        .collect();

        let mut fetch = FetchSettings::default();
        if let Some(attempts) = var("KILN_FETCH_ATTEMPTS") {
            fetch.max_attempts = attempts.trim().parse::<u32>().map_err(|e| {
                KilnError::Config(format!("Invalid KILN_FETCH_ATTEMPTS '{attempts}': {e}"))
            })?;
            if fetch.max_attempts == 0 {
                return Err(KilnError::Config(
                    "KILN_FETCH_ATTEMPTS must be at least 1".to_string(),
                ));
            }
        }
        if let Some(backoff) = var("KILN_FETCH_BACKOFF") {
            fetch.initial_backoff = parse_duration("KILN_FETCH_BACKOFF", &backoff)?;
        }
        if let Some(timeout) = var("KILN_FETCH_TIMEOUT") {
            fetch.timeout = parse_duration("KILN_FETCH_TIMEOUT", &timeout)?;
        }

        let max_workers = match var("KILN_JOBS") {
            Some(jobs) => jobs
                .trim()
                .parse::<usize>()
                .map_err(|e| KilnError::Config(format!("Invalid KILN_JOBS '{jobs}': {e}")))?
                .max(1),
            None => std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(6),
        };

        debug!("Effective KILN_ROOT set to: {}", kiln_root.display());
        Ok(Self {
            kiln_root,
            formula_dirs,
            base_path,
            fetch,
            max_workers,
        })
    }

    /// Configuration rooted at `root` with every other setting at its default.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let kiln_root = root.into();
        Self {
            formula_dirs: vec![kiln_root.join("Formula")],
            base_path: env::split_paths(DEFAULT_BASE_PATH).collect(),
            fetch: FetchSettings::default(),
            max_workers: 2,
            kiln_root,
        }
    }

    /// Creates the directory skeleton under the root.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.cellar_dir(),
            self.opt_dir(),
            self.bin_dir(),
            self.cache_dir(),
            self.tmp_dir(),
            self.state_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                KilnError::Config(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.kiln_root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.kiln_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.kiln_root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.kiln_root.join("cache")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.kiln_root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("kiln")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("log")
    }

    pub fn installed_index_path(&self) -> PathBuf {
        self.state_dir().join("installed.json")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    pub fn base_path_string(&self) -> String {
        join_paths_lossy(&self.base_path)
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| KilnError::Config(format!("Invalid {key} '{value}': {e}")))
}

/// Joins paths with ':' without failing on entries that contain the separator.
pub fn join_paths_lossy<P: AsRef<Path>>(paths: &[P]) -> String {
    paths
        .iter()
        .map(|p| p.as_ref().to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_root_and_derives_layout() {
        let config = Config::from_lookup(lookup(&[("KILN_ROOT", "/srv/kiln")])).unwrap();
        assert_eq!(config.kiln_root(), Path::new("/srv/kiln"));
        assert_eq!(config.formula_dirs, vec![PathBuf::from("/srv/kiln/Formula")]);
        assert_eq!(
            config.formula_keg_path("dvd", "HEAD-1a2b3c4"),
            PathBuf::from("/srv/kiln/Cellar/dvd/HEAD-1a2b3c4")
        );
        assert_eq!(
            config.installed_index_path(),
            PathBuf::from("/srv/kiln/var/kiln/installed.json")
        );
        assert_eq!(config.base_path_string(), DEFAULT_BASE_PATH);
        assert_eq!(config.fetch, FetchSettings::default());
    }

    #[test]
    fn parses_fetch_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("KILN_ROOT", "/srv/kiln"),
            ("KILN_FETCH_ATTEMPTS", "5"),
            ("KILN_FETCH_BACKOFF", "10ms"),
            ("KILN_FETCH_TIMEOUT", "2m"),
            ("KILN_FORMULA_PATH", "/a:/b"),
            ("KILN_JOBS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(config.fetch.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.fetch.timeout, Duration::from_secs(120));
        assert_eq!(
            config.formula_dirs,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("KILN_ROOT", "relative/root")])).is_err());
        assert!(Config::from_lookup(lookup(&[
            ("KILN_ROOT", "/srv/kiln"),
            ("KILN_FETCH_ATTEMPTS", "0")
        ]))
        .is_err());
        assert!(Config::from_lookup(lookup(&[
            ("KILN_ROOT", "/srv/kiln"),
            ("KILN_FETCH_TIMEOUT", "soon")
        ]))
        .is_err());
    }
}
