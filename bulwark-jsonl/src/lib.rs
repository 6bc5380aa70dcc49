//! JSONL sink for `bulwark`. Writes one call record per line.
//! Always appends; bring your own path.

use async_trait::async_trait;
use bulwark::call_log::{CallLog, CallRecord};
use bulwark::StoreError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct JsonlCallLog {
    path: PathBuf,
    // Serializes appends so concurrent records never interleave within a line.
    write: Mutex<()>,
}

impl JsonlCallLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), write: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CallLog for JsonlCallLog {
    async fn record(&self, record: CallRecord) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');

        let _guard = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        file.flush().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::trace!(target: "bulwark::jsonl", provider = %record.provider, "call record appended");
        Ok(())
    }
}
