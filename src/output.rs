//! Trace output: formatting and the shared writer.

use crate::config::OutputDestination;
use crate::policy::BodyPolicy;
use crate::record::{RequestRecord, ResponseRecord};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Appends trace entries to stdout or a file.
///
/// Clones share the underlying writer; each entry is written whole.
#[derive(Clone)]
pub struct TraceWriter {
    inner: Arc<Mutex<Output>>,
}

impl TraceWriter {
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout())
    }

    pub async fn append_to(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(Self::from_writer(file))
    }

    pub async fn open(destination: &OutputDestination) -> anyhow::Result<Self> {
        match destination {
            OutputDestination::Stdout => Ok(Self::stdout()),
            OutputDestination::File(path) => Self::append_to(path).await,
        }
    }

    pub async fn write_entry(&self, entry: &str) -> std::io::Result<()> {
        let mut out = self.inner.lock().await;
        out.write_all(entry.as_bytes()).await?;
        out.flush().await
    }
}

fn entry_header(at: DateTime<Utc>, url: &str) -> String {
    format!("[{} {}]\n", at.to_rfc3339_opts(SecondsFormat::Millis, true), url)
}

/// `[TIMESTAMP URL]`, then the request block, then the response block.
pub fn format_exchange(
    at: DateTime<Utc>,
    url: &str,
    request: &RequestRecord,
    response: &ResponseRecord,
    policy: &dyn BodyPolicy,
) -> String {
    let mut entry = entry_header(at, url);
    entry.push_str(&request.pretty_string(policy));
    entry.push_str(&response.pretty_string(policy));
    entry
}

/// Entry for an exchange that never produced records.
pub fn format_failure(at: DateTime<Utc>, url: &str, error: &dyn Display) -> String {
    let mut entry = entry_header(at, url);
    entry.push_str(&format!("! {error}\n"));
    entry
}
