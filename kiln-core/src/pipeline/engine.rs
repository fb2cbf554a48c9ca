// kiln-core/src/pipeline/engine.rs
use crossbeam_channel::Receiver as CrossbeamReceiver;
use kiln_common::error::Result;
use kiln_common::pipeline::{AttemptOutcome, AttemptReport, PipelineEvent, PlannedJob};
use threadpool::ThreadPool;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::worker;
use crate::attempt::Installer;

/// Runs jobs from `job_rx` on a pool of `num_workers` threads until the channel closes.
///
/// Every job produces exactly one report on `report_tx`. Blocks until all submitted
/// jobs have finished.
#[instrument(skip_all, name = "core_worker_manager")]
pub fn start_worker_pool_manager(
    installer: Installer,
    handle: Handle,
    num_workers: usize,
    job_rx: CrossbeamReceiver<PlannedJob>,
    report_tx: mpsc::UnboundedSender<AttemptReport>,
) -> Result<()> {
    let num_workers = num_workers.max(1);
    let pool = ThreadPool::new(num_workers);
    debug!("Core worker pool manager started with {} workers.", num_workers);

    for job in job_rx {
        let job_id = job.name.clone();
        debug!("[{}] Received job from channel, submitting to pool.", job_id);

        let installer = installer.clone();
        let handle = handle.clone();
        let report_tx = report_tx.clone();
        pool.execute(move || {
            let event_tx = installer.event_sender().clone();
            let report = worker::execute_job(&installer, &handle, job);
            match &report.outcome {
                AttemptOutcome::Verified => {
                    let version = report
                        .keg
                        .as_ref()
                        .map(|k| k.version.clone())
                        .unwrap_or_default();
                    let _ = event_tx.send(PipelineEvent::JobSuccess {
                        target_id: job_id.clone(),
                        version,
                    });
                }
                AttemptOutcome::Failed { stage, error } => {
                    let _ = event_tx.send(PipelineEvent::job_failed(
                        job_id.clone(),
                        Some(*stage),
                        error,
                    ));
                }
            }
            if report_tx.send(report).is_err() {
                warn!("[{}] Runner is gone, dropping report.", job_id);
            }
        });
    }
    pool.join();
    debug!("Core worker pool manager finished.");
    Ok(())
}
