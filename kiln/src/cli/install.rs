// kiln/src/cli/install.rs
use std::sync::Arc;

use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::keg::InstalledIndex;
use kiln_core::{run_pipeline, Installer};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cli::status;

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Formula names or paths to formula files
    #[arg(required = true)]
    names: Vec<String>,
}

impl InstallArgs {
    #[instrument(skip(self, config, cancel), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        let index = InstalledIndex::load(config.installed_index_path())?;
        let formulary = Formulary::new(config);
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let installer = Installer::new(
            Arc::new(config.clone()),
            Arc::new(formulary),
            Arc::new(index),
            event_tx,
        )?
        .with_cancellation(cancel.clone());

        let status_handle = tokio::spawn(status::handle_events(event_rx));
        let result = run_pipeline(&installer, &self.names).await;
        // Closes the event channel if the pipeline broke down before finishing.
        drop(installer);
        if status_handle.await.is_err() {
            debug!("Status printer task ended abnormally");
        }

        let summary = result?;
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }
        match summary.first_error() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
