//! Record source: streams the newline-delimited buffer file into the dispatcher.
//!
//! Records travel over a bounded mpsc channel, so reading the file is paced by
//! how fast the worker pool takes records off the queue.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::record::{RecordError, ResourceRecord};

/// Default capacity of the record queue between the reader and the pool.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Errors that can occur while reading records.
#[derive(Debug)]
pub enum SourceError {
    /// Buffer file could not be opened or read
    Io { path: PathBuf, source: std::io::Error },

    /// A line is not a valid resource
    Parse { line: u64, source: RecordError },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Io { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            SourceError::Parse { line, source } => {
                write!(f, "Malformed resource on line {}: {}", line, source)
            }
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Io { source, .. } => Some(source),
            SourceError::Parse { source, .. } => Some(source),
        }
    }
}

/// Create the bounded queue that connects a record source to the dispatcher.
pub fn record_channel(
    capacity: usize,
) -> (mpsc::Sender<ResourceRecord>, mpsc::Receiver<ResourceRecord>) {
    mpsc::channel(capacity.max(1))
}

/// Read every record of the buffer file at `path` into `tx`.
///
/// Returns the number of records queued. Stops early, without error, when the
/// receiving side has gone away.
pub async fn read_buffer_file(
    path: &Path,
    tx: mpsc::Sender<ResourceRecord>,
) -> Result<u64, SourceError> {
    let file = File::open(path).await.map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(path = %path.display(), "Reading buffer file");

    stream_records(BufReader::new(file), tx)
        .await
        .map_err(|e| match e {
            SourceError::Io { source, .. } => SourceError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
}

/// Parse one record per line from `reader` and send each into `tx`.
///
/// Blank lines are skipped. The line number in a parse error is 1-based.
pub async fn stream_records<R>(
    reader: R,
    tx: mpsc::Sender<ResourceRecord>,
) -> Result<u64, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number: u64 = 0;
    let mut queued: u64 = 0;

    while let Some(line) = lines.next_line().await.map_err(|source| SourceError::Io {
        path: PathBuf::new(),
        source,
    })? {
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        let record = ResourceRecord::parse(line).map_err(|source| SourceError::Parse {
            line: line_number,
            source,
        })?;

        if tx.send(record).await.is_err() {
            debug!(queued = queued, "Record queue closed, reader stopping");
            return Ok(queued);
        }
        queued += 1;
    }

    debug!(queued = queued, "Buffer file exhausted");
    Ok(queued)
}
