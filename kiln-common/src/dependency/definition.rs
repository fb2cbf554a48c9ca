use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Phases in which a dependency must be present, relative to the formula being built.
    ///
    /// An empty set marks a node that is only needed to build another node of the plan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME = 0b0000_0001;
        const BUILD   = 0b0000_0010;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::BUILD) {
            parts.push("build");
        }
        if self.contains(Self::RUNTIME) {
            parts.push("run");
        }
        if parts.is_empty() {
            parts.push("install-only");
        }
        f.write_str(&parts.join("+"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPhase {
    Build,
    #[default]
    #[serde(alias = "runtime")]
    Run,
}

impl DependencyPhase {
    pub fn tag(self) -> DependencyTag {
        match self {
            Self::Build => DependencyTag::BUILD,
            Self::Run => DependencyTag::RUNTIME,
        }
    }
}

/// Either `"name"` (a run-time dependency) or `{ name, phase }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        phase: DependencyPhase,
    },
}

impl From<DependencyRepr> for Dependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Name(name) => Self::new_runtime(name),
            DependencyRepr::Full { name, phase } => Self { name, phase },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DependencyRepr")]
pub struct Dependency {
    pub name: String,
    pub phase: DependencyPhase,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: DependencyPhase::Run,
        }
    }

    pub fn new_build(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: DependencyPhase::Build,
        }
    }

    pub fn tags(&self) -> DependencyTag {
        self.phase.tag()
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag) -> Vec<&Dependency>;
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for [Dependency] {
    fn filter_by_tags(&self, include: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags().intersects(include))
            .collect()
    }

    fn runtime(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::RUNTIME)
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::BUILD)
    }
}
