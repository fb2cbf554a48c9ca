// kiln-common/src/dependency/resolver.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error};

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::keg::InstalledIndex;
use crate::model::formula::Formula;

pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub index: &'a InstalledIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Installed,
    Missing,
}

#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub name: String,
    /// Loaded for missing nodes; installed nodes may have no formula file anymore.
    pub formula: Option<Arc<Formula>>,
    pub status: ResolutionStatus,
    pub accumulated_tags: DependencyTag,
    /// Install prefix of an installed node.
    pub path: Option<PathBuf>,
    /// Names of the nodes this one needs, in declaration order.
    pub requires: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub target: String,
    /// Every transitive dependency, dependencies before dependents.
    pub activation_order: Vec<ResolvedDependency>,
    pub build_dependency_paths: Vec<(String, PathBuf)>,
    pub runtime_dependency_paths: Vec<(String, PathBuf)>,
}

impl ResolvedPlan {
    pub fn installable_order(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.activation_order
            .iter()
            .filter(|d| d.status == ResolutionStatus::Missing)
    }

    /// Fails with `UnresolvedDependency` for the first node that is not installed.
    pub fn require_installed(&self) -> Result<()> {
        match self.installable_order().next() {
            Some(missing) => Err(KilnError::UnresolvedDependency {
                formula: self.target.clone(),
                dependency: missing.name.clone(),
                reason: "not installed".to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn dependency_path(&self, name: &str) -> Option<&Path> {
        self.activation_order
            .iter()
            .find(|d| d.name == name)
            .and_then(|d| d.path.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.activation_order.is_empty()
    }
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    visiting: Vec<String>,
    resolution_details: HashMap<String, ResolvedDependency>,
    order: Vec<String>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            visiting: Vec::new(),
            resolution_details: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Resolves the dependency graph below `formula` against the installed index.
    pub fn resolve(&mut self, formula: &Formula) -> Result<ResolvedPlan> {
        debug!("Starting dependency resolution for '{}'", formula.name);
        self.visiting.clear();
        self.resolution_details.clear();
        self.order.clear();

        self.visiting.push(formula.name.clone());
        for dep in formula.dependencies() {
            self.resolve_recursive(&formula.name, dep, dep.tags())?;
        }
        self.visiting.pop();

        let activation_order: Vec<ResolvedDependency> = self
            .order
            .iter()
            .filter_map(|name| self.resolution_details.get(name).cloned())
            .collect();

        let mut build_paths = Vec::new();
        let mut runtime_paths = Vec::new();
        for dep in &activation_order {
            if let Some(path) = &dep.path {
                if dep.accumulated_tags.contains(DependencyTag::BUILD) {
                    build_paths.push((dep.name.clone(), path.clone()));
                }
                if dep.accumulated_tags.contains(DependencyTag::RUNTIME) {
                    runtime_paths.push((dep.name.clone(), path.clone()));
                }
            }
        }

        debug!(
            "Resolved '{}': {:?}",
            formula.name,
            activation_order
                .iter()
                .map(|d| (d.name.as_str(), d.status, d.accumulated_tags))
                .collect::<Vec<_>>()
        );

        Ok(ResolvedPlan {
            target: formula.name.clone(),
            activation_order,
            build_dependency_paths: build_paths,
            runtime_dependency_paths: runtime_paths,
        })
    }

    fn resolve_recursive(
        &mut self,
        parent: &str,
        dep: &Dependency,
        tags_from_parent_edge: DependencyTag,
    ) -> Result<()> {
        let name = dep.name.as_str();

        if let Some(pos) = self.visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = self.visiting[pos..].to_vec();
            cycle.push(name.to_string());
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(KilnError::DependencyCycle(cycle));
        }

        if let Some(existing) = self.resolution_details.get_mut(name) {
            let combined = existing.accumulated_tags | tags_from_parent_edge;
            if combined == existing.accumulated_tags {
                return Ok(());
            }
            debug!(
                "Updating tags for '{}' from {} to {}",
                name, existing.accumulated_tags, combined
            );
            existing.accumulated_tags = combined;
            let children = self.children_of(name);
            self.visiting.push(name.to_string());
            for (child, edge) in children {
                self.resolve_recursive(name, &child, edge)?;
            }
            self.visiting.pop();
            return Ok(());
        }

        let node = self.load_node(parent, name, tags_from_parent_edge)?;
        self.resolution_details.insert(name.to_string(), node);

        let children = self.children_of(name);
        self.visiting.push(name.to_string());
        for (child, edge) in children {
            self.resolve_recursive(name, &child, edge)?;
        }
        self.visiting.pop();

        self.order.push(name.to_string());
        Ok(())
    }

    fn load_node(
        &self,
        parent: &str,
        name: &str,
        tags: DependencyTag,
    ) -> Result<ResolvedDependency> {
        if let Some(keg) = self.context.index.get(name) {
            debug!("'{}' is installed at {}", name, keg.prefix.display());
            return Ok(ResolvedDependency {
                name: name.to_string(),
                formula: self.context.formulary.load_formula(name).ok(),
                status: ResolutionStatus::Installed,
                accumulated_tags: tags,
                path: Some(keg.prefix),
                requires: keg.runtime_dependencies,
            });
        }

        let formula = self
            .context
            .formulary
            .load_formula(name)
            .map_err(|e| KilnError::UnresolvedDependency {
                formula: parent.to_string(),
                dependency: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ResolvedDependency {
            name: name.to_string(),
            requires: formula
                .dependencies()
                .iter()
                .map(|d| d.name.clone())
                .collect(),
            formula: Some(formula),
            status: ResolutionStatus::Missing,
            accumulated_tags: tags,
            path: None,
        })
    }

    /// Edges to follow from `name`, with the tags each child inherits.
    ///
    /// Run-time children inherit the node's tags. Build-time children of a missing
    /// node are needed only to build that node. Installed nodes expose only their
    /// recorded run-time dependencies.
    fn children_of(&self, name: &str) -> Vec<(Dependency, DependencyTag)> {
        let Some(node) = self.resolution_details.get(name) else {
            return Vec::new();
        };
        match (&node.status, &node.formula) {
            (ResolutionStatus::Missing, Some(formula)) => formula
                .dependencies()
                .iter()
                .map(|d| {
                    let edge = match d.tags() {
                        t if t.contains(DependencyTag::BUILD) => DependencyTag::empty(),
                        _ => node.accumulated_tags,
                    };
                    (d.clone(), edge)
                })
                .collect(),
            _ => node
                .requires
                .iter()
                .map(|n| (Dependency::new_runtime(n.clone()), node.accumulated_tags))
                .collect(),
        }
    }
}
