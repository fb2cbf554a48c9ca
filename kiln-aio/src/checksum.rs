// kiln-aio/src/checksum.rs
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Hex SHA-256 of a file, read asynchronously.
pub async fn sha256_file_async(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut total_bytes_read = 0u64;

    loop {
        buffer.clear();
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 of {}: {} ({} bytes read)",
        path.display(),
        actual,
        total_bytes_read
    );
    Ok(actual)
}

/// Verifies the SHA-256 of a file. A mismatch is `ChecksumMismatch`, never retried.
pub async fn verify_checksum_async(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file_async(path).await?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KilnError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn verifies_matching_digest_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello").unwrap();

        assert_eq!(sha256_bytes(b"hello"), HELLO_SHA);
        verify_checksum_async(&path, &HELLO_SHA.to_uppercase())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mismatch_reports_both_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello!").unwrap();

        match verify_checksum_async(&path, HELLO_SHA).await {
            Err(KilnError::ChecksumMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, HELLO_SHA);
                assert_eq!(actual, sha256_bytes(b"hello!"));
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }
}
