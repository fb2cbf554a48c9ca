// kiln-core/src/attempt.rs
//! One install attempt of one formula.
//!
//! An attempt moves through `Pending → SourceAcquired → DependenciesResolved →
//! Sandboxed → Built → Tested → Verified`. The first error stops it and is recorded
//! against the stage it was trying to enter. Only a Verified attempt is recorded in
//! the installed index.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kiln_aio::fs::remove_dir_all_if_exists_async;
use kiln_common::config::Config;
use kiln_common::dependency::{DependencyResolver, ResolutionContext, ResolvedPlan};
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::keg::{InstalledIndex, InstalledKeg};
use kiln_common::model::Formula;
use kiln_common::pipeline::{
    AttemptOutcome, AttemptReport, InstallResult, InstallStatus, PipelineEvent, Stage,
    VerificationResult,
};
use kiln_net::RetryPolicy;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::build::link::receipt_path;
use crate::build::{self, link_keg, InstallReceipt};
use crate::sandbox::{BuildSandbox, Confinement, PathAudit};
use crate::source::SourceAcquirer;
use crate::verify::verify;

/// Runs install attempts against one kiln root.
///
/// Cheap to clone; clones share the index, formulary and cancellation token.
#[derive(Clone)]
pub struct Installer {
    config: Arc<Config>,
    formulary: Arc<Formulary>,
    index: Arc<InstalledIndex>,
    acquirer: Arc<SourceAcquirer>,
    confinement: Arc<dyn Confinement>,
    event_tx: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

/// What an attempt has produced so far.
#[derive(Debug, Default)]
struct Progress {
    stage: Stage,
    /// Set when a failure belongs to a later stage than the one being entered.
    failed_at: Option<Stage>,
    prefix: Option<PathBuf>,
    install: Option<InstallResult>,
    verification: Option<VerificationResult>,
    keg: Option<InstalledKeg>,
}

impl Installer {
    pub fn new(
        config: Arc<Config>,
        formulary: Arc<Formulary>,
        index: Arc<InstalledIndex>,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Result<Self> {
        let acquirer = SourceAcquirer::new(&config)?;
        let confinement = PathAudit::new(&config).with_index(Arc::clone(&index));
        Ok(Self {
            config,
            formulary,
            index,
            acquirer: Arc::new(acquirer),
            confinement: Arc::new(confinement),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_confinement(mut self, confinement: Arc<dyn Confinement>) -> Self {
        self.confinement = confinement;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.acquirer = Arc::new((*self.acquirer).clone().with_policy(policy));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn formulary(&self) -> &Arc<Formulary> {
        &self.formulary
    }

    pub fn index(&self) -> &Arc<InstalledIndex> {
        &self.index
    }

    pub fn event_sender(&self) -> &broadcast::Sender<PipelineEvent> {
        &self.event_tx
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs one attempt to completion, failure or cancellation.
    #[instrument(skip_all, fields(formula = %formula.name))]
    pub async fn run(&self, formula: Arc<Formula>) -> AttemptReport {
        let started = Instant::now();
        let name = formula.name.clone();
        let _ = self.event_tx.send(PipelineEvent::AttemptStarted {
            target_id: name.clone(),
        });

        let mut progress = Progress::default();
        let Some(_claim) = self.index.try_claim(&name) else {
            let error = KilnError::InstallError(format!(
                "{name} is already being installed by another attempt"
            ));
            warn!("{}", error);
            return AttemptReport {
                formula: name,
                outcome: AttemptOutcome::Failed {
                    stage: Stage::Pending,
                    error,
                },
                stage_reached: Stage::Pending,
                install: None,
                verification: None,
                keg: None,
                duration: started.elapsed(),
            };
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KilnError::Cancelled),
            result = self.drive(&formula, &mut progress) => result,
        };

        let outcome = match result {
            Ok(()) => {
                info!("{} verified in {:.2}s", name, started.elapsed().as_secs_f64());
                AttemptOutcome::Verified
            }
            Err(error) => {
                let stage = progress.failed_at.unwrap_or_else(|| progress.stage.next());
                if matches!(error, KilnError::Cancelled) {
                    warn!("Install of {} cancelled before {}", name, stage);
                    if progress.stage < Stage::Built {
                        if let Some(prefix) = &progress.prefix {
                            discard_keg(prefix).await;
                        }
                    }
                } else {
                    error!("Install of {} failed entering {}: {}", name, stage, error);
                }
                AttemptOutcome::Failed { stage, error }
            }
        };

        AttemptReport {
            formula: name,
            outcome,
            stage_reached: progress.stage,
            install: progress.install,
            verification: progress.verification,
            keg: progress.keg,
            duration: started.elapsed(),
        }
    }

    async fn drive(&self, formula: &Formula, progress: &mut Progress) -> Result<()> {
        let sandbox = BuildSandbox::allocate(&self.config, &formula.name, self.event_tx.clone())?;
        let result = self.drive_in(&sandbox, formula, progress).await;
        if let Err(e) = sandbox.teardown() {
            warn!("Sandbox teardown for {} failed: {}", formula.name, e);
        }
        result
    }

    fn plan(&self, formula: &Formula) -> Result<ResolvedPlan> {
        let plan = DependencyResolver::new(ResolutionContext {
            formulary: &self.formulary,
            index: &self.index,
        })
        .resolve(formula)?;
        plan.require_installed()?;
        formula.validate()?;
        Ok(plan)
    }

    async fn drive_in(
        &self,
        sandbox: &BuildSandbox,
        formula: &Formula,
        progress: &mut Progress,
    ) -> Result<()> {
        // Resolution does not need the source, so a cycle or a missing dependency
        // fails before anything is fetched.
        let plan = match self.plan(formula) {
            Ok(plan) => plan,
            Err(e) => {
                progress.failed_at = Some(Stage::DependenciesResolved);
                return Err(e);
            }
        };
        let source = self
            .acquirer
            .acquire(&formula.name, &formula.source, sandbox.root())
            .await?;
        self.advance(formula, progress, Stage::SourceAcquired);
        self.advance(formula, progress, Stage::DependenciesResolved);

        let version = formula.keg_version(&source.reference);
        let prefix = self.config.formula_keg_path(&formula.name, &version);
        let context = sandbox.prepare(&self.config, &plan, formula, &source, &prefix)?;
        if prefix.exists() {
            debug!("Removing stale keg {}", prefix.display());
            remove_dir_all_if_exists_async(&prefix).await?;
        }
        std::fs::create_dir_all(&prefix)?;
        progress.prefix = Some(prefix.clone());
        let snapshot = match self.confinement.begin(&context) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                discard_keg(&prefix).await;
                return Err(e);
            }
        };
        self.advance(formula, progress, Stage::Sandboxed);

        let install = match build::execute(
            &formula.install,
            &context,
            self.confinement.as_ref(),
            &self.event_tx,
        )
        .await
        {
            Ok(install) => install,
            Err(e) => {
                discard_keg(&prefix).await;
                return Err(e);
            }
        };
        let status = install.status;
        progress.install = Some(install);
        if let InstallStatus::Failed { step, exit_code } = status {
            discard_keg(&prefix).await;
            return Err(KilnError::BuildStepFailed { step, exit_code });
        }
        if let Err(e) = self.confinement.audit(&context, snapshot) {
            discard_keg(&prefix).await;
            return Err(e);
        }
        self.advance(formula, progress, Stage::Built);

        let verification = verify(
            &formula.test,
            &prefix,
            &context.test_env(),
            context.substitutions(),
        )
        .await;
        let failure = verification.failure_reason.clone();
        let passed = verification.passed;
        progress.verification = Some(verification);
        if !passed {
            warn!(
                "Keeping unverified keg {} for inspection; it is not recorded as installed",
                prefix.display()
            );
            return Err(KilnError::AssertionFailed(failure.unwrap_or_default()));
        }
        self.advance(formula, progress, Stage::Tested);

        let links = link_keg(&self.config, &formula.name, &prefix)?;
        let installed_at = Utc::now();
        let runtime_dependencies = formula.runtime_dependency_names();
        let receipt = InstallReceipt {
            name: formula.name.clone(),
            version: version.clone(),
            source: source.reference.clone(),
            installed_at,
            runtime_dependencies: runtime_dependencies.clone(),
            links: links.paths(),
        };
        // Dropping `links` before the commit below undoes them.
        kiln_aio::write_json_async(&receipt_path(&prefix), &receipt).await?;

        let keg = InstalledKeg {
            name: formula.name.clone(),
            version,
            source: source.reference,
            prefix,
            installed_at,
            runtime_dependencies,
        };
        self.index.mark_installed(keg.clone())?;
        links.commit();
        progress.keg = Some(keg);
        self.advance(formula, progress, Stage::Verified);
        Ok(())
    }

    fn advance(&self, formula: &Formula, progress: &mut Progress, stage: Stage) {
        debug!("{} reached {}", formula.name, stage);
        progress.stage = stage;
        let _ = self.event_tx.send(PipelineEvent::StageReached {
            target_id: formula.name.clone(),
            stage,
        });
    }
}

/// Removes a keg that must not survive the attempt.
async fn discard_keg(prefix: &Path) {
    debug!("Discarding keg {}", prefix.display());
    if let Err(e) = remove_dir_all_if_exists_async(prefix).await {
        warn!("Failed to remove keg {}: {}", prefix.display(), e);
    }
}
