use std::path::PathBuf;

use kiln_common::error::{KilnError, Result};
use url::Url;

/// Accepts `https` URLs and `file` URLs (local mirrors).
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| KilnError::ValidationError(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        other => Err(KilnError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': must be https or file, got '{other}'"
        ))),
    }
}

/// Local path of a `file://` URL.
pub fn local_path(url: &Url) -> Option<PathBuf> {
    if url.scheme() == "file" {
        url.to_file_path().ok()
    } else {
        None
    }
}

/// Last path segment of the URL, used as the cached file name.
pub fn file_name_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
