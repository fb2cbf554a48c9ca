// kiln-core/src/pipeline/planner.rs
use std::collections::HashSet;

use kiln_common::dependency::{DependencyResolver, ResolutionContext};
use kiln_common::formulary::Formulary;
use kiln_common::keg::InstalledIndex;
use kiln_common::pipeline::{PipelineEvent, PlannedJob, PlannedOperations};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

pub struct OperationPlanner<'a> {
    formulary: &'a Formulary,
    index: &'a InstalledIndex,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl<'a> OperationPlanner<'a> {
    pub fn new(
        formulary: &'a Formulary,
        index: &'a InstalledIndex,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            formulary,
            index,
            event_tx,
        }
    }

    /// Resolves every target and merges the formulae that still need building into
    /// one job list, dependencies first.
    ///
    /// Problems with one target are recorded and do not stop the others.
    #[instrument(skip_all, fields(targets = ?targets))]
    pub fn plan_operations(&self, targets: &[String]) -> PlannedOperations {
        let _ = self.event_tx.send(PipelineEvent::PlanningStarted);
        let mut ops = PlannedOperations::default();
        let mut seen_targets = HashSet::new();

        for target in targets {
            if !seen_targets.insert(target.as_str()) {
                continue;
            }
            let formula = match self.formulary.load_target(target) {
                Ok(formula) => formula,
                Err(e) => {
                    warn!("Cannot load formula '{}': {}", target, e);
                    ops.errors.push((target.clone(), e));
                    continue;
                }
            };
            let name = formula.name.clone();
            if self.index.contains(&name) {
                debug!("{} is already installed", name);
                ops.already_installed.insert(name);
                continue;
            }

            let plan = match DependencyResolver::new(ResolutionContext {
                formulary: self.formulary,
                index: self.index,
            })
            .resolve(&formula)
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("Cannot resolve dependencies of '{}': {}", name, e);
                    ops.errors.push((name, e));
                    continue;
                }
            };

            let missing: HashSet<&str> = plan
                .installable_order()
                .map(|d| d.name.as_str())
                .collect();
            for node in plan.installable_order() {
                let Some(dep_formula) = node.formula.clone() else {
                    continue;
                };
                if ops.jobs.iter().any(|j| j.name == node.name) {
                    continue;
                }
                let depends_on = node
                    .requires
                    .iter()
                    .filter(|r| missing.contains(r.as_str()))
                    .cloned()
                    .collect();
                ops.jobs.push(PlannedJob {
                    name: node.name.clone(),
                    formula: dep_formula,
                    is_target: false,
                    depends_on,
                });
            }

            if let Some(job) = ops.jobs.iter_mut().find(|j| j.name == name) {
                job.is_target = true;
                continue;
            }
            let depends_on = formula
                .dependencies()
                .iter()
                .filter(|d| missing.contains(d.name.as_str()))
                .map(|d| d.name.clone())
                .collect();
            ops.jobs.push(PlannedJob {
                name,
                formula,
                is_target: true,
                depends_on,
            });
        }

        debug!(
            "Planned jobs: {:?}",
            ops.jobs.iter().map(|j| j.name.as_str()).collect::<Vec<_>>()
        );
        let _ = self.event_tx.send(PipelineEvent::PlanningFinished {
            job_count: ops.jobs.len(),
        });
        ops
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;
    use kiln_common::keg::InstalledKeg;
    use kiln_common::model::source::SourceReference;
    use kiln_common::model::Formula;
    use kiln_common::KilnError;
    use pretty_assertions::assert_eq;

    use super::*;

    fn formula(name: &str, deps: &str) -> Formula {
        Formula::from_toml_str(&format!(
            "name = \"{name}\"\ndependencies = [{deps}]\n\n[source]\nkind = \"head\"\nurl = \"https://example.com/{name}.git\"\n"
        ))
        .unwrap()
    }

    fn setup() -> (Formulary, InstalledIndex) {
        let formulary = Formulary::with_search_paths(Vec::new());
        formulary.register(formula("app", r#""libfoo", { name = "go", phase = "build" }"#));
        formulary.register(formula("tool", r#""libfoo""#));
        formulary.register(formula("libfoo", r#""zlib""#));
        formulary.register(formula("zlib", ""));
        formulary.register(formula("go", ""));
        formulary.register(formula("loop-a", r#""loop-b""#));
        formulary.register(formula("loop-b", r#""loop-a""#));

        let index = InstalledIndex::in_memory();
        index
            .mark_installed(InstalledKeg {
                name: "go".into(),
                version: "1.22".into(),
                source: SourceReference::Sha256("0".repeat(64)),
                prefix: PathBuf::from("/k/Cellar/go/1.22"),
                installed_at: Utc::now(),
                runtime_dependencies: Vec::new(),
            })
            .unwrap();
        (formulary, index)
    }

    fn names(ops: &PlannedOperations) -> Vec<&str> {
        ops.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn merges_shared_dependencies_across_targets() {
        let (formulary, index) = setup();
        let (tx, _) = broadcast::channel(16);
        let planner = OperationPlanner::new(&formulary, &index, tx);

        let ops = planner.plan_operations(&["app".into(), "tool".into(), "go".into()]);

        assert_eq!(names(&ops), vec!["zlib", "libfoo", "app", "tool"]);
        assert!(ops.errors.is_empty());
        assert!(ops.already_installed.contains("go"));
        let job = |n: &str| ops.jobs.iter().find(|j| j.name == n).unwrap();
        assert_eq!(job("app").depends_on, vec!["libfoo".to_string()]);
        assert_eq!(job("libfoo").depends_on, vec!["zlib".to_string()]);
        assert!(job("tool").is_target && !job("zlib").is_target);
    }

    #[test]
    fn a_dependency_named_as_target_is_marked_as_one() {
        let (formulary, index) = setup();
        let (tx, _) = broadcast::channel(16);
        let ops = OperationPlanner::new(&formulary, &index, tx)
            .plan_operations(&["app".into(), "zlib".into()]);
        assert_eq!(names(&ops), vec!["zlib", "libfoo", "app"]);
        assert!(ops.jobs[0].is_target);
    }

    #[test]
    fn unknown_and_cyclic_targets_are_recorded_as_errors() {
        let (formulary, index) = setup();
        let (tx, _) = broadcast::channel(16);
        let ops = OperationPlanner::new(&formulary, &index, tx)
            .plan_operations(&["nope".into(), "loop-a".into(), "zlib".into()]);

        assert_eq!(names(&ops), vec!["zlib"]);
        assert_eq!(ops.errors.len(), 2);
        assert!(matches!(ops.errors[0].1, KilnError::NotFound(_)));
        assert!(matches!(ops.errors[1].1, KilnError::DependencyCycle(_)));
    }
}
