// kiln-net/src/http.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_aio::checksum::verify_checksum_async;
use kiln_common::error::{KilnError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tokio::fs::{self, File as TokioFile};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use url::Url;

use crate::retry::{fetch_with_retry, RetryPolicy};
use crate::validation::{file_name_from_url, local_path, validate_url};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

pub fn build_http_client(timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KilnError::from)
}

/// Downloads a checksummed archive into `cache_dir`, trying `mirrors` after `url`.
///
/// A cached file whose checksum still matches is reused without touching the network.
/// A checksum mismatch is fatal and is not retried on mirrors.
pub async fn fetch_archive(
    client: &Client,
    formula_name: &str,
    url: &str,
    sha256_expected: &str,
    mirrors: &[String],
    cache_dir: &Path,
    policy: &RetryPolicy,
) -> Result<PathBuf> {
    let primary = validate_url(url)?;
    let file_name = file_name_from_url(&primary).unwrap_or_else(|| "download".to_string());
    let cache_path = cache_dir.join(format!("{formula_name}--{file_name}"));

    if cache_path.is_file() {
        match verify_checksum_async(&cache_path, sha256_expected).await {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                return Ok(cache_path);
            }
            Err(e) => {
                debug!(
                    "Cached file {} is stale ({}), downloading again",
                    cache_path.display(),
                    e
                );
                if let Err(remove_err) = fs::remove_file(&cache_path).await {
                    warn!(
                        "Failed to remove stale cached file {}: {}",
                        cache_path.display(),
                        remove_err
                    );
                }
            }
        }
    }
    fs::create_dir_all(cache_dir).await?;

    let mut last_error = None;
    for candidate in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
        let parsed = validate_url(candidate)?;
        let (parsed, target) = (&parsed, cache_path.as_path());
        let result = fetch_with_retry(policy, candidate, move |_| {
            download_and_verify(client, parsed, target, sha256_expected)
        })
        .await;
        match result {
            Ok(path) => return Ok(path),
            Err(e @ (KilnError::ChecksumMismatch { .. } | KilnError::Cancelled)) => return Err(e),
            Err(e) => {
                error!("Download failed from {}: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| KilnError::FetchFailed {
        url: url.to_string(),
        attempts: 0,
        reason: "no download locations".to_string(),
    }))
}

async fn download_and_verify(
    client: &Client,
    url: &Url,
    final_path: &Path,
    sha256_expected: &str,
) -> Result<PathBuf> {
    let temp_path = final_path.with_file_name(format!(
        ".{}.download",
        final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    if fs::try_exists(&temp_path).await.unwrap_or(false) {
        fs::remove_file(&temp_path).await?;
    }

    if let Some(source) = local_path(url) {
        debug!("Copying local mirror {}", source.display());
        fs::copy(&source, &temp_path).await?;
    } else {
        stream_to_file(client, url, &temp_path).await?;
    }

    if let Err(e) = verify_checksum_async(&temp_path, sha256_expected).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(match e {
            KilnError::ChecksumMismatch {
                expected, actual, ..
            } => KilnError::ChecksumMismatch {
                path: url.to_string(),
                expected,
                actual,
            },
            other => other,
        });
    }

    fs::rename(&temp_path, final_path).await?;
    debug!("Verified download stored at {}", final_path.display());
    Ok(final_path.to_path_buf())
}

async fn stream_to_file(client: &Client, url: &Url, temp_path: &Path) -> Result<()> {
    let mut response = client.get(url.clone()).send().await?;
    let status = response.status();
    debug!("Received HTTP status {} for {}", status, url);

    if !status.is_success() {
        let transient = status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT;
        return Err(if transient {
            KilnError::Network(format!("HTTP {status} for {url}"))
        } else {
            KilnError::NotFound(format!("HTTP {status} for {url}"))
        });
    }

    let mut file = TokioFile::create(temp_path).await?;
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|e| KilnError::Network(format!("reading body of {url}: {e}")))?;
        match chunk {
            Some(bytes) => file.write_all(&bytes).await?,
            None => break,
        }
    }
    file.flush().await?;
    Ok(())
}
