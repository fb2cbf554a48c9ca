// kiln-aio/src/json_io.rs
use std::path::Path;

use kiln_common::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Writes pretty-printed JSON atomically.
pub async fn write_json_async<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    debug!("Writing JSON to: {}", path.display());
    let json_bytes = serde_json::to_vec_pretty(data)?;
    crate::fs::atomic_write_file_async(path, json_bytes).await
}

pub async fn read_json_async<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Reading JSON from: {}", path.display());
    let json_bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&json_bytes)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/receipt.json");
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), "dvd".to_string());

        write_json_async(&path, &data).await.unwrap();
        let back: BTreeMap<String, String> = read_json_async(&path).await.unwrap();
        assert_eq!(back, data);
    }
}
