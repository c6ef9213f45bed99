//! Offloads the log's blocking file operations off the dispatcher task
//! (spec.md §5 "Suspension points"): appends and applied-entry pruning both
//! touch the filesystem and must not run on the single dispatcher thread
//! directly.

use std::sync::{Arc, Mutex};

use crate::error::{RaftError, Result};
use crate::log::{Log, LogEntry};
use crate::proto::LogIndex;

pub async fn append_entry(log: Arc<Mutex<Log>>, entry: LogEntry) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut guard = log.lock().unwrap();
        guard.append(entry)
    })
    .await
    .map_err(|e| RaftError::Io(e.to_string()))?
}

pub async fn discard_applied(log: Arc<Mutex<Log>>, up_to: LogIndex) {
    let _ = tokio::task::spawn_blocking(move || {
        log.lock().unwrap().discard_applied_log_entries(up_to);
    })
    .await;
}
