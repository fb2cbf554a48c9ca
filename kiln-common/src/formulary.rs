use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::formula::{validate_name, Formula};

const FORMULA_EXTENSIONS: [&str; 2] = ["toml", "json"];

/// Finds and parses formula files, caching each parsed formula by name.
#[derive(Debug)]
pub struct Formulary {
    search_paths: Vec<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self::with_search_paths(config.formula_dirs.clone())
    }

    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn find_formula_path(&self, name: &str) -> Option<PathBuf> {
        self.search_paths.iter().find_map(|dir| {
            FORMULA_EXTENSIONS
                .iter()
                .map(|ext| dir.join(format!("{name}.{ext}")))
                .find(|candidate| candidate.is_file())
        })
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        if let Some(formula) = self.cached(name) {
            debug!("Loaded formula '{}' from parsed cache.", name);
            return Ok(formula);
        }
        validate_name(name)?;

        let path = self.find_formula_path(name).ok_or_else(|| {
            KilnError::NotFound(format!(
                "Formula '{name}' not found in {}",
                self.search_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        let formula = Formula::from_path(&path)?;
        if formula.name != name {
            return Err(KilnError::ValidationError(format!(
                "{} declares name '{}', expected '{name}'",
                path.display(),
                formula.name
            )));
        }
        debug!("Parsed formula '{}' from {}", name, path.display());
        Ok(self.register(formula))
    }

    /// Loads a formula file given by path. The formula becomes resolvable by name.
    pub fn load_path(&self, path: &Path) -> Result<Arc<Formula>> {
        let formula = Formula::from_path(path)?;
        Ok(self.register(formula))
    }

    /// Accepts either a formula name or a path to a formula file.
    pub fn load_target(&self, target: &str) -> Result<Arc<Formula>> {
        let path = Path::new(target);
        let looks_like_path = target.contains('/')
            || path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FORMULA_EXTENSIONS.contains(&e));
        if looks_like_path {
            self.load_path(path)
        } else {
            self.load_formula(target)
        }
    }

    pub fn register(&self, formula: Formula) -> Arc<Formula> {
        let formula = Arc::new(formula);
        self.parsed_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(formula.name.clone(), Arc::clone(&formula));
        formula
    }

    fn cached(&self, name: &str) -> Option<Arc<Formula>> {
        self.parsed_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
