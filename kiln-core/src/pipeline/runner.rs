// kiln-core/src/pipeline/runner.rs
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded as crossbeam_bounded;
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::{
    AttemptOutcome, AttemptReport, JobProcessingState, PipelineEvent, PlannedJob,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, instrument, warn};

use super::engine;
use super::planner::OperationPlanner;
use super::worker::get_panic_message;
use crate::attempt::Installer;

const WORKER_JOB_CHANNEL_SIZE: usize = 100;

/// Everything that happened in one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    /// Reports of the attempts that ran, in completion order.
    pub reports: Vec<AttemptReport>,
    /// Targets that could not be planned.
    pub planning_errors: Vec<(String, KilnError)>,
    /// Jobs never attempted because a job they depend on failed.
    pub skipped: Vec<(String, KilnError)>,
    pub already_installed: BTreeSet<String>,
    pub duration: Duration,
}

impl PipelineSummary {
    pub fn success_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.is_verified())
            .count()
    }

    pub fn fail_count(&self) -> usize {
        self.reports.len() - self.success_count() + self.planning_errors.len() + self.skipped.len()
    }

    pub fn is_success(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn report(&self, name: &str) -> Option<&AttemptReport> {
        self.reports.iter().find(|r| r.formula == name)
    }

    /// The error that decides the outcome: planning first, then attempts in
    /// completion order, then skipped dependents.
    pub fn first_error(&self) -> Option<&KilnError> {
        self.planning_errors
            .iter()
            .map(|(_, e)| e)
            .chain(self.reports.iter().filter_map(|r| r.outcome.error()))
            .chain(self.skipped.iter().map(|(_, e)| e))
            .next()
    }
}

struct RunState<'a> {
    jobs: &'a [PlannedJob],
    states: HashMap<String, JobProcessingState>,
    event_tx: broadcast::Sender<PipelineEvent>,
    pending: usize,
    skipped: Vec<(String, KilnError)>,
}

/// Plans `targets` and builds every missing formula, independent ones in parallel.
///
/// Returns `Err` only when the pipeline itself breaks down; failed installs are in
/// the summary.
#[instrument(skip_all, fields(targets = ?targets))]
pub async fn run_pipeline(installer: &Installer, targets: &[String]) -> Result<PipelineSummary> {
    let start_time = Instant::now();
    let event_tx = installer.event_sender().clone();

    let planner =
        OperationPlanner::new(installer.formulary(), installer.index(), event_tx.clone());
    let planned = planner.plan_operations(targets);

    for name in &planned.already_installed {
        let _ = event_tx.send(PipelineEvent::LogInfo {
            message: format!("{name} is already installed."),
        });
    }
    for (name, err) in &planned.errors {
        let _ = event_tx.send(PipelineEvent::LogError {
            message: format!("Error during planning for '{name}': {err}"),
        });
    }

    let jobs = planned.jobs;
    let mut summary = PipelineSummary {
        planning_errors: planned.errors,
        already_installed: planned.already_installed.into_iter().collect(),
        ..PipelineSummary::default()
    };

    if !jobs.is_empty() {
        let _ = event_tx.send(PipelineEvent::PipelineStarted {
            total_jobs: jobs.len(),
        });

        let (job_tx, job_rx) = crossbeam_bounded::<PlannedJob>(WORKER_JOB_CHANNEL_SIZE);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<AttemptReport>();
        let core_installer = installer.clone();
        let handle = Handle::current();
        let num_workers = installer.config().max_workers;
        let core_handle = std::thread::spawn(move || {
            engine::start_worker_pool_manager(
                core_installer,
                handle,
                num_workers,
                job_rx,
                report_tx,
            )
        });

        let mut run = RunState {
            jobs: &jobs,
            states: jobs
                .iter()
                .map(|j| (j.name.clone(), JobProcessingState::WaitingForDependencies))
                .collect(),
            event_tx: event_tx.clone(),
            pending: jobs.len(),
            skipped: Vec::new(),
        };

        check_and_dispatch(&mut run, &job_tx, installer);
        debug!("RUNNER: Entering main loop. Jobs pending/active: {}", run.pending);
        while run.pending > 0 {
            let Some(report) = report_rx.recv().await else {
                warn!(
                    "RUNNER: Report channel closed with {} job(s) outstanding.",
                    run.pending
                );
                break;
            };
            run.pending = run.pending.saturating_sub(1);
            match &report.outcome {
                AttemptOutcome::Verified => {
                    debug!("[{}] RUNNER: Job succeeded.", report.formula);
                    run.states
                        .insert(report.formula.clone(), JobProcessingState::Succeeded);
                }
                AttemptOutcome::Failed { error, .. } => {
                    debug!("[{}] RUNNER: Job failed: {}", report.formula, error);
                    let error = Arc::new(error.clone());
                    run.states.insert(
                        report.formula.clone(),
                        JobProcessingState::Failed(Arc::clone(&error)),
                    );
                    propagate_failure(&mut run, &report.formula, &error);
                }
            }
            summary.reports.push(report);
            check_and_dispatch(&mut run, &job_tx, installer);
        }
        summary.skipped = std::mem::take(&mut run.skipped);

        drop(job_tx);
        let joined = tokio::task::spawn_blocking(move || core_handle.join())
            .await
            .map_err(|e| KilnError::Generic(format!("JoinError waiting for worker pool: {e}")))?;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("RUNNER: Core worker pool manager failed: {}", e);
                return Err(e);
            }
            Err(panic) => {
                let message = get_panic_message(panic);
                error!("RUNNER: Core worker pool manager panicked: {}", message);
                return Err(KilnError::Generic(format!(
                    "worker pool manager panicked: {message}"
                )));
            }
        }
    }

    summary.duration = start_time.elapsed();
    let _ = event_tx.send(PipelineEvent::PipelineFinished {
        duration_secs: summary.duration.as_secs_f64(),
        success_count: summary.success_count(),
        fail_count: summary.fail_count(),
    });
    Ok(summary)
}

/// Dispatches every waiting job whose dependencies have all succeeded.
///
/// Once cancelled, waiting jobs are failed instead of dispatched.
fn check_and_dispatch(
    run: &mut RunState<'_>,
    job_tx: &crossbeam_channel::Sender<PlannedJob>,
    installer: &Installer,
) {
    let cancelled = installer.cancellation().is_cancelled();
    for job in run.jobs {
        if !matches!(
            run.states.get(&job.name),
            Some(JobProcessingState::WaitingForDependencies)
        ) {
            continue;
        }
        if cancelled {
            run.states.insert(
                job.name.clone(),
                JobProcessingState::Failed(Arc::new(KilnError::Cancelled)),
            );
            run.pending = run.pending.saturating_sub(1);
            let _ = run.event_tx.send(PipelineEvent::job_failed(
                job.name.clone(),
                None,
                &KilnError::Cancelled,
            ));
            run.skipped.push((job.name.clone(), KilnError::Cancelled));
            continue;
        }
        let ready = job.depends_on.iter().all(|dep| {
            matches!(run.states.get(dep), Some(JobProcessingState::Succeeded) | None)
        });
        if !ready {
            continue;
        }
        if job_tx.send(job.clone()).is_ok() {
            debug!("[{}] CheckDispatch: Dispatched.", job.name);
            run.states
                .insert(job.name.clone(), JobProcessingState::Dispatched);
            let _ = run.event_tx.send(PipelineEvent::JobDispatched {
                target_id: job.name.clone(),
            });
        } else {
            error!("[{}] CheckDispatch: Worker channel closed.", job.name);
            let err = KilnError::Generic("Worker channel closed".to_string());
            run.states.insert(
                job.name.clone(),
                JobProcessingState::Failed(Arc::new(err.clone())),
            );
            run.pending = run.pending.saturating_sub(1);
            let _ = run
                .event_tx
                .send(PipelineEvent::job_failed(job.name.clone(), None, &err));
            run.skipped.push((job.name.clone(), err));
        }
    }
}

/// Fails every job that depends, directly or not, on `failed_job`.
fn propagate_failure(run: &mut RunState<'_>, failed_job: &str, reason: &KilnError) {
    let mut queue = vec![failed_job.to_string()];
    let mut seen = HashSet::new();
    while let Some(source) = queue.pop() {
        for job in run.jobs {
            if !job.depends_on.contains(&source) || seen.contains(&job.name) {
                continue;
            }
            if !matches!(
                run.states.get(&job.name),
                Some(JobProcessingState::WaitingForDependencies)
            ) {
                continue;
            }
            let error = KilnError::UnresolvedDependency {
                formula: job.name.clone(),
                dependency: source.clone(),
                reason: format!("dependency failed: {reason}"),
            };
            debug!("[{}] PropagateFailure: {}", job.name, error);
            run.states.insert(
                job.name.clone(),
                JobProcessingState::Failed(Arc::new(error.clone())),
            );
            run.pending = run.pending.saturating_sub(1);
            let _ = run
                .event_tx
                .send(PipelineEvent::job_failed(job.name.clone(), None, &error));
            run.skipped.push((job.name.clone(), error));
            seen.insert(job.name.clone());
            queue.push(job.name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_common::config::Config;
    use kiln_common::formulary::Formulary;
    use kiln_common::keg::InstalledIndex;
    use kiln_common::model::Formula;
    use kiln_common::pipeline::Stage;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{config_with_tools, init_repo, write_tool};

    /// `make-bin` writes `$KILN_PREFIX/bin/<name>`; `fail` exits 1.
    fn setup(max_workers: usize) -> (tempfile::TempDir, Arc<Config>, String) {
        let root = tempfile::tempdir().unwrap();
        let tools = root.path().join("tools");
        write_tool(
            &tools,
            "make-bin",
            "mkdir -p \"$KILN_PREFIX/bin\"\nprintf '#!/bin/sh\\necho %s\\n' \"$KILN_FORMULA\" > \"$KILN_PREFIX/bin/$KILN_FORMULA\"\nchmod 755 \"$KILN_PREFIX/bin/$KILN_FORMULA\"",
        );
        write_tool(&tools, "fail", "exit 1");
        let mut config = config_with_tools(&root.path().join("kiln"), &tools);
        config.max_workers = max_workers;
        let repo = root.path().join("repo");
        init_repo(&repo, &[("README", "source")]);
        (root, Arc::new(config), repo.display().to_string())
    }

    fn formula(name: &str, deps: &str, tool: &str, url: &str) -> Formula {
        Formula::from_toml_str(&format!(
            r#"
name = "{name}"
dependencies = [{deps}]
install = [{{ kind = "invoke", tool = "{tool}" }}]
test = [{{ kind = "invoke_succeeds", program = "{name}", output = "{name}" }}]

[source]
kind = "head"
url = "{url}"
branch = "main"
"#
        ))
        .unwrap()
    }

    fn installer(config: &Arc<Config>, formulae: Vec<Formula>) -> Installer {
        let formulary = Formulary::with_search_paths(Vec::new());
        for f in formulae {
            formulary.register(f);
        }
        let index = InstalledIndex::load(config.installed_index_path()).unwrap();
        let (tx, _) = broadcast::channel(1024);
        Installer::new(
            Arc::clone(config),
            Arc::new(formulary),
            Arc::new(index),
            tx,
        )
        .unwrap()
    }

    fn installed(config: &Config) -> Vec<String> {
        InstalledIndex::load(config.installed_index_path())
            .unwrap()
            .snapshot()
            .into_keys()
            .collect()
    }

    fn graph(url: &str) -> Vec<Formula> {
        vec![
            formula("zlib", "", "make-bin", url),
            formula("libfoo", r#""zlib""#, "make-bin", url),
            formula("app", r#""libfoo""#, "make-bin", url),
            formula("tool", "", "make-bin", url),
            formula("jq", "", "make-bin", url),
        ]
    }

    fn bin_names(config: &Config) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(config.bin_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_installs_match_a_sequential_run() {
        let targets: Vec<String> = ["app", "tool", "jq"].iter().map(|s| s.to_string()).collect();

        let (_seq_root, seq_config, seq_url) = setup(1);
        let sequential = installer(&seq_config, graph(&seq_url));
        let seq = run_pipeline(&sequential, &targets).await.unwrap();

        let (_par_root, par_config, par_url) = setup(4);
        let parallel = installer(&par_config, graph(&par_url));
        let par = run_pipeline(&parallel, &targets).await.unwrap();

        assert!(seq.is_success(), "{:?}", seq.first_error());
        assert!(par.is_success(), "{:?}", par.first_error());
        assert_eq!(seq.success_count(), 5);
        assert_eq!(installed(&seq_config), installed(&par_config));
        assert_eq!(installed(&par_config), vec!["app", "jq", "libfoo", "tool", "zlib"]);
        assert_eq!(bin_names(&seq_config), bin_names(&par_config));

        // Dependencies finished before their dependents.
        let position = |name: &str| par.reports.iter().position(|r| r.formula == name).unwrap();
        assert!(position("zlib") < position("libfoo"));
        assert!(position("libfoo") < position("app"));
        assert!(std::fs::read_dir(par_config.tmp_dir()).unwrap().next().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_job_fails_its_dependents_without_building_them() {
        let (_root, config, url) = setup(2);
        let formulae = vec![
            formula("zlib", "", "fail", &url),
            formula("libfoo", r#""zlib""#, "make-bin", &url),
            formula("app", r#""libfoo""#, "make-bin", &url),
            formula("tool", "", "make-bin", &url),
        ];
        let installer = installer(&config, formulae);
        let mut events = installer.event_sender().subscribe();

        let summary = run_pipeline(&installer, &["app".into(), "tool".into()])
            .await
            .unwrap();

        assert_eq!(summary.success_count(), 1);
        assert_eq!(summary.fail_count(), 3);
        assert!(summary.report("libfoo").is_none());
        let zlib = summary.report("zlib").unwrap();
        assert!(matches!(
            zlib.outcome,
            AttemptOutcome::Failed {
                stage: Stage::Built,
                error: KilnError::BuildStepFailed { .. }
            }
        ));
        let skipped: Vec<&str> = summary.skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped.len(), 2);
        assert!(skipped.contains(&"libfoo") && skipped.contains(&"app"));
        assert!(summary.skipped.iter().all(|(_, e)| matches!(
            e,
            KilnError::UnresolvedDependency { .. }
        )));
        assert!(matches!(
            summary.first_error(),
            Some(KilnError::BuildStepFailed { .. })
        ));
        assert_eq!(installed(&config), vec!["tool"]);

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::PipelineFinished {
                success_count,
                fail_count,
                ..
            } = event
            {
                finished = Some((success_count, fail_count));
            }
        }
        assert_eq!(finished, Some((1, 3)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn installed_targets_and_planning_errors_are_reported() {
        let (_root, config, url) = setup(2);
        let installer = installer(&config, graph(&url));
        run_pipeline(&installer, &["jq".into()]).await.unwrap();

        let summary = run_pipeline(&installer, &["jq".into(), "missing".into()])
            .await
            .unwrap();

        assert!(summary.reports.is_empty());
        assert!(summary.already_installed.contains("jq"));
        assert_eq!(summary.planning_errors.len(), 1);
        assert!(!summary.is_success());
        assert!(matches!(
            summary.first_error(),
            Some(KilnError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_pipeline_installs_nothing() {
        let (_root, config, url) = setup(2);
        let installer = installer(&config, graph(&url));
        installer.cancellation().cancel();

        let summary = run_pipeline(&installer, &["app".into()]).await.unwrap();

        assert_eq!(summary.success_count(), 0);
        assert!(matches!(summary.first_error(), Some(KilnError::Cancelled)));
        assert!(installed(&config).is_empty());
    }
}
