use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::recipe::{Assertion, InstallStep};
use super::source::{SourceReference, SourceSpec};
use crate::dependency::{Dependency, DependencyExt};
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    #[serde(default, alias = "description")]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    /// Required for archive sources. Git sources derive their version from the commit.
    #[serde(default)]
    pub version: Option<String>,
    pub source: SourceSpec,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default, alias = "install_recipe")]
    pub install: Vec<InstallStep>,
    #[serde(default, alias = "test_recipe")]
    pub test: Vec<Assertion>,
}

impl Formula {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let formula: Formula = toml::from_str(content)?;
        formula.validate()?;
        Ok(formula)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let formula: Formula = serde_json::from_str(content)?;
        formula.validate()?;
        Ok(formula)
    }

    /// Loads a `.toml` or `.json` formula file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!("Parsing formula file {}", path.display());
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => Err(KilnError::ParseError(
                "formula",
                format!(
                    "{} is neither a .toml nor a .json formula",
                    path.display()
                ),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn declares_dependency(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d.name == name)
    }

    pub fn runtime_dependency_names(&self) -> Vec<String> {
        self.dependencies
            .runtime()
            .into_iter()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Static checks that need no filesystem or network access.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        self.source.validate().map_err(|e| match e {
            KilnError::ValidationError(msg) => {
                KilnError::ValidationError(format!("formula '{}': {msg}", self.name))
            }
            other => other,
        })?;

        if matches!(self.source, SourceSpec::Archive { .. })
            && !matches!(self.version.as_deref(), Some(v) if !v.trim().is_empty())
        {
            return Err(KilnError::ValidationError(format!(
                "formula '{}': archive sources require a version",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            validate_name(&dep.name)?;
            if !seen.insert(dep.name.as_str()) {
                return Err(KilnError::ValidationError(format!(
                    "formula '{}' declares dependency '{}' more than once",
                    self.name, dep.name
                )));
            }
        }

        let step_templates = self.install.iter().map(InstallStep::templates);
        let test_templates = self.test.iter().map(Assertion::templates);
        for templates in step_templates.chain(test_templates) {
            for template in templates? {
                for dep in template.dependency_refs() {
                    if !self.declares_dependency(dep) {
                        return Err(KilnError::UnresolvedDependency {
                            formula: self.name.clone(),
                            dependency: dep.to_string(),
                            reason: format!(
                                "referenced by '{}' but not declared",
                                template.raw()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Version string of the keg built from `reference`.
    pub fn keg_version(&self, reference: &SourceReference) -> String {
        match (&self.source, &self.version) {
            (SourceSpec::Archive { .. }, Some(version)) => version.clone(),
            (SourceSpec::Head { .. }, _) => format!("HEAD-{}", reference.short()),
            (_, version) => format!(
                "{}-{}",
                version.as_deref().unwrap_or("HEAD"),
                reference.short()
            ),
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '@' | '-')
        });
    if valid {
        Ok(())
    } else {
        Err(KilnError::ValidationError(format!(
            "invalid formula name '{name}'"
        )))
    }
}
