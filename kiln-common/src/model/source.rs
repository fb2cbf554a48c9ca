use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{KilnError, Result};

fn default_branch() -> String {
    "main".to_string()
}

/// Where a formula's source comes from.
///
/// Only `Archive` carries a checksum. `Head` follows the moving tip of a branch and is
/// not reproducible over time; `Revision` pins a commit instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Archive {
        url: String,
        sha256: String,
        #[serde(default)]
        mirrors: Vec<String>,
    },
    Head {
        url: String,
        #[serde(default = "default_branch")]
        branch: String,
    },
    Revision {
        url: String,
        revision: String,
    },
}

impl SourceSpec {
    pub fn url(&self) -> &str {
        match self {
            Self::Archive { url, .. } | Self::Head { url, .. } | Self::Revision { url, .. } => url,
        }
    }

    pub fn is_reproducible(&self) -> bool {
        !matches!(self, Self::Head { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Archive {
                url,
                sha256,
                mirrors,
            } => {
                for u in std::iter::once(url).chain(mirrors.iter()) {
                    parse_source_url(u)?;
                }
                if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(KilnError::ValidationError(format!(
                        "archive sha256 must be 64 hex characters, got '{sha256}'"
                    )));
                }
            }
            Self::Head { url, branch } => {
                validate_repository(url)?;
                if branch.trim().is_empty() {
                    return Err(KilnError::ValidationError(
                        "head source requires a branch name".to_string(),
                    ));
                }
            }
            Self::Revision { url, revision } => {
                validate_repository(url)?;
                if revision.len() < 7 || !revision.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(KilnError::ValidationError(format!(
                        "revision must be a commit id of at least 7 hex characters, got '{revision}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_source_url(raw: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|e| KilnError::ValidationError(format!("invalid source URL '{raw}': {e}")))
}

/// Repositories may also be given as local paths, which libgit2 clones directly.
fn validate_repository(raw: &str) -> Result<()> {
    if raw.starts_with('/') {
        return Ok(());
    }
    parse_source_url(raw).map(|_| ())
}

/// Identity of the source that was actually acquired.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SourceReference {
    Sha256(String),
    Commit(String),
}

impl SourceReference {
    pub fn short(&self) -> &str {
        let id = match self {
            Self::Sha256(s) | Self::Commit(s) => s.as_str(),
        };
        match id.char_indices().nth(7) {
            Some((end, _)) => &id[..end],
            None => id,
        }
    }
}

impl fmt::Display for SourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(s) => write!(f, "sha256:{s}"),
            Self::Commit(s) => write!(f, "git:{s}"),
        }
    }
}

impl From<SourceReference> for String {
    fn from(value: SourceReference) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SourceReference {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if let Some(hash) = value.strip_prefix("sha256:") {
            Ok(Self::Sha256(hash.to_string()))
        } else if let Some(commit) = value.strip_prefix("git:") {
            Ok(Self::Commit(commit.to_string()))
        } else {
            Err(format!("unrecognised source reference '{value}'"))
        }
    }
}
