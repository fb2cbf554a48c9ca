// kiln-core/src/pipeline/worker.rs
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use kiln_common::error::KilnError;
use kiln_common::pipeline::{AttemptOutcome, AttemptReport, PlannedJob, Stage};
use tokio::runtime::Handle;
use tracing::{debug, error, instrument};

use crate::attempt::Installer;

pub(crate) fn get_panic_message(e: Box<dyn std::any::Any + Send>) -> String {
    match e.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match e.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}

/// Drives one attempt to completion on the runtime behind `handle`.
///
/// Runs on a pool thread. A panicking attempt becomes a failed report so the
/// runner still hears back about the job.
#[instrument(skip_all, fields(job_id = %job.name))]
pub(super) fn execute_job(
    installer: &Installer,
    handle: &Handle,
    job: PlannedJob,
) -> AttemptReport {
    let started = Instant::now();
    let name = job.name.clone();
    debug!("[{}] Worker starting attempt", name);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        handle.block_on(installer.run(job.formula))
    }));
    match result {
        Ok(report) => report,
        Err(payload) => {
            let message = get_panic_message(payload);
            error!("[{}] Install attempt panicked: {}", name, message);
            AttemptReport {
                formula: name,
                outcome: AttemptOutcome::Failed {
                    stage: Stage::Pending,
                    error: KilnError::Generic(format!("install attempt panicked: {message}")),
                },
                stage_reached: Stage::Pending,
                install: None,
                verification: None,
                keg: None,
                duration: started.elapsed(),
            }
        }
    }
}
