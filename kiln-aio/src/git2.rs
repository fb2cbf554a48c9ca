// kiln-aio/src/git2.rs
//! Blocking clones through libgit2. Callers run these on a blocking thread.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{CertificateCheckStatus, ErrorClass, FetchOptions, RemoteCallbacks, Repository};
use kiln_common::error::{KilnError, Result};
use tracing::{debug, error};

/// Transport-level failures are worth retrying; everything else is a property of the
/// repository (missing branch, unknown commit) and will not change on a second try.
fn classify(url: &str, err: git2::Error) -> KilnError {
    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl | ErrorClass::Os => {
            KilnError::Network(format!("{url}: {}", err.message()))
        }
        _ => KilnError::from(err),
    }
}

fn fetch_options(abort: &AtomicBool) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |_| !abort.load(Ordering::Relaxed));
    callbacks.sideband_progress(move |_| !abort.load(Ordering::Relaxed));
    callbacks.certificate_check(move |_, _| {
        if abort.load(Ordering::Relaxed) {
            Err(git2::Error::from_str("clone aborted"))
        } else {
            Ok(CertificateCheckStatus::CertificatePassthrough)
        }
    });
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// Fails with `Cancelled` once `abort` is set.
pub fn check_abort(abort: &AtomicBool) -> Result<()> {
    if abort.load(Ordering::Relaxed) {
        Err(KilnError::Cancelled)
    } else {
        Ok(())
    }
}

/// Clones the tip of `branch` into `dest` and returns the checked-out commit id.
///
/// Setting `abort` stops the transfer at the next remote callback.
pub fn clone_branch(url: &str, branch: &str, dest: &Path, abort: &AtomicBool) -> Result<String> {
    debug!("Cloning {} (branch {}) into {}", url, branch, dest.display());
    let repo = RepoBuilder::new()
        .branch(branch)
        .fetch_options(fetch_options(abort))
        .clone(url, dest)
        .map_err(|e| {
            check_abort(abort).err().unwrap_or_else(|| {
                error!("Failed to clone {}: {}", url, e);
                classify(url, e)
            })
        })?;
    check_abort(abort)?;
    head_commit(&repo)
}

/// Clones `url` and checks out `revision` as a detached head.
pub fn clone_revision(
    url: &str,
    revision: &str,
    dest: &Path,
    abort: &AtomicBool,
) -> Result<String> {
    debug!("Cloning {} at {} into {}", url, revision, dest.display());
    let repo = RepoBuilder::new()
        .fetch_options(fetch_options(abort))
        .clone(url, dest)
        .map_err(|e| {
            check_abort(abort).err().unwrap_or_else(|| {
                error!("Failed to clone {}: {}", url, e);
                classify(url, e)
            })
        })?;
    check_abort(abort)?;

    let commit = repo
        .revparse_single(revision)
        .and_then(|object| object.peel_to_commit())
        .map_err(|e| {
            KilnError::NotFound(format!("revision {revision} in {url}: {}", e.message()))
        })?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit.id())?;
    Ok(commit.id().to_string())
}

fn head_commit(repo: &Repository) -> Result<String> {
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

/// Repository fixtures for tests in this and dependent crates.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::path::Path;

    use git2::{Repository, RepositoryInitOptions, Signature};

    /// Creates a repository on branch `main` at `dir`, one commit per entry of `commits`.
    /// Returns the commit ids in order.
    pub fn init_repo(dir: &Path, commits: &[&[(&str, &str)]]) -> Vec<String> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir, &opts).unwrap();
        let sig = Signature::now("kiln", "kiln@example.com").unwrap();
        let mut ids = Vec::new();
        for files in commits {
            for (path, content) in *files {
                let full = dir.join(path);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(full, content).unwrap();
            }
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let parents = match repo.head() {
                Ok(head) => vec![head.peel_to_commit().unwrap()],
                Err(_) => Vec::new(),
            };
            let parent_refs: Vec<_> = parents.iter().collect();
            let id = repo
                .commit(Some("HEAD"), &sig, &sig, "commit", &tree, &parent_refs)
                .unwrap();
            ids.push(id.to_string());
        }
        ids
    }
}
