// kiln-core/src/source.rs
//! Source Acquirer: materialises a formula's source into a staging directory.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use kiln_aio::extract::single_top_level_dir;
use kiln_aio::fs::rename_dir_into_place;
use kiln_aio::git2::check_abort;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::source::{SourceReference, SourceSpec};
use kiln_net::RetryPolicy;
use reqwest::Client;
use tracing::{debug, instrument};

/// Name of the source directory inside the staging parent.
pub const SOURCE_DIR_NAME: &str = "source";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredSource {
    pub dir: PathBuf,
    pub reference: SourceReference,
}

#[derive(Debug, Clone)]
pub struct SourceAcquirer {
    client: Client,
    cache_dir: PathBuf,
    policy: RetryPolicy,
}

/// Sets the flag when dropped so a blocking clone stops at its next remote callback.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl SourceAcquirer {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: kiln_net::build_http_client(config.fetch.timeout)?,
            cache_dir: config.cache_dir(),
            policy: RetryPolicy::from(&config.fetch),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Acquires `spec` into `<staging_parent>/source`.
    ///
    /// Everything is materialised in a hidden directory next to the target and renamed
    /// into place only once complete.
    #[instrument(skip(self, spec, staging_parent), fields(url = %spec.url()))]
    pub async fn acquire(
        &self,
        formula_name: &str,
        spec: &SourceSpec,
        staging_parent: &Path,
    ) -> Result<AcquiredSource> {
        std::fs::create_dir_all(staging_parent)?;
        let dest = staging_parent.join(SOURCE_DIR_NAME);
        match spec {
            SourceSpec::Archive {
                url,
                sha256,
                mirrors,
            } => {
                self.acquire_archive(formula_name, url, sha256, mirrors, staging_parent, &dest)
                    .await
            }
            SourceSpec::Head { url, branch } => {
                let branch = branch.clone();
                self.acquire_git(url, staging_parent, &dest, move |url, checkout, abort| {
                    kiln_aio::git2::clone_branch(url, &branch, checkout, abort)
                })
                .await
            }
            SourceSpec::Revision { url, revision } => {
                let revision = revision.clone();
                self.acquire_git(url, staging_parent, &dest, move |url, checkout, abort| {
                    kiln_aio::git2::clone_revision(url, &revision, checkout, abort)
                })
                .await
            }
        }
    }

    async fn acquire_archive(
        &self,
        formula_name: &str,
        url: &str,
        sha256: &str,
        mirrors: &[String],
        staging_parent: &Path,
        dest: &Path,
    ) -> Result<AcquiredSource> {
        let archive = kiln_net::fetch_archive(
            &self.client,
            formula_name,
            url,
            sha256,
            mirrors,
            &self.cache_dir,
            &self.policy,
        )
        .await?;

        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(staging_parent)?;
        kiln_aio::extract_archive_async(&archive, staging.path(), 0).await?;
        let root = single_top_level_dir(staging.path())?;
        rename_dir_into_place(&root, dest)?;

        debug!("Archive for {} unpacked into {}", formula_name, dest.display());
        Ok(AcquiredSource {
            dir: dest.to_path_buf(),
            reference: SourceReference::Sha256(sha256.to_ascii_lowercase()),
        })
    }

    async fn acquire_git<F>(
        &self,
        url: &str,
        staging_parent: &Path,
        dest: &Path,
        clone: F,
    ) -> Result<AcquiredSource>
    where
        F: Fn(&str, &Path, &AtomicBool) -> Result<String> + Clone + Send + 'static,
    {
        // A timed-out attempt leaves its thread running until libgit2 returns. Clone
        // threads take this lock so the next attempt waits for the abandoned one.
        let clone_lock = Arc::new(Mutex::new(()));
        let result = kiln_net::fetch_with_retry(&self.policy, url, |attempt| {
            let clone = clone.clone();
            let url = url.to_string();
            let staging_parent = staging_parent.to_path_buf();
            let dest = dest.to_path_buf();
            let clone_lock = Arc::clone(&clone_lock);
            async move {
                let abort = Arc::new(AtomicBool::new(false));
                let _guard = AbortOnDrop(Arc::clone(&abort));
                tokio::task::spawn_blocking(move || -> Result<String> {
                    let _held = clone_lock.lock().unwrap_or_else(PoisonError::into_inner);
                    check_abort(&abort)?;
                    // Each attempt starts from an empty directory.
                    let staging = tempfile::Builder::new()
                        .prefix(".clone-")
                        .tempdir_in(&staging_parent)?;
                    let checkout = staging.path().join("checkout");
                    debug!("Clone attempt {} of {}", attempt, url);
                    let commit = clone(url.as_str(), checkout.as_path(), abort.as_ref())?;
                    check_abort(&abort)?;
                    rename_dir_into_place(&checkout, &dest)?;
                    Ok(commit)
                })
                .await
                .map_err(|e| KilnError::Generic(format!("JoinError in git clone: {e}")))?
            }
        })
        .await;

        // Nothing may write under `staging_parent` once this returns.
        let straggler = Arc::clone(&clone_lock);
        tokio::task::spawn_blocking(move || {
            let _held = straggler.lock().unwrap_or_else(PoisonError::into_inner);
        })
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError in git clone: {e}")))?;
        let commit = result?;

        Ok(AcquiredSource {
            dir: dest.to_path_buf(),
            reference: SourceReference::Commit(commit),
        })
    }
}
