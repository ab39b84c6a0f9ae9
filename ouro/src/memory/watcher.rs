//! Conversation log watcher.
//!
//! A single background task watches the log directory, debounces per-file
//! events, and drives reconciliation through the narrow [`Reconcile`]
//! interface (the engine side holds only a weak handle, keeping the
//! ownership graph one-way). Reconcile failures are retried with exponential
//! backoff and never surfaced synchronously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MemoryError;

/// Result of one reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stored hash matched the file; nothing to do.
    Skipped,
    Applied {
        inserted: usize,
        deleted: usize,
    },
}

/// Narrow reconciliation interface the watcher calls through.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, conversation_id: &str) -> Result<ReconcileOutcome, MemoryError>;
}

/// Ceiling for the per-conversation retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Handle to the running watcher task.
pub struct LogWatcher {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    // Dropping the OS watcher stops event delivery; keep it alive here.
    _watcher: notify::RecommendedWatcher,
}

impl LogWatcher {
    /// Watches `log_dir` for `.jsonl` changes. Events for one file are
    /// coalesced within `debounce`; reconciles run one at a time on the
    /// watcher task, so per-conversation serialization holds trivially.
    /// `pending` mirrors the number of conversations waiting for a
    /// reconcile, which search uses to flag possibly-partial results.
    pub fn spawn(
        log_dir: impl AsRef<Path>,
        debounce: Duration,
        reconciler: Arc<dyn Reconcile>,
        pending: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Result<Self, MemoryError> {
        let (tx, rx) = mpsc::unbounded_channel::<String>();

        let mut watcher = notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
            let Ok(event) = event else { return };
            for path in event.paths {
                if let Some(id) = conversation_id_of(&path) {
                    let _ = tx.send(id);
                }
            }
        })
        .map_err(|e| MemoryError::Watcher(e.to_string()))?;
        watcher
            .watch(log_dir.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| MemoryError::Watcher(e.to_string()))?;

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(run_loop(rx, debounce, reconciler, pending, task_cancel));

        Ok(Self {
            cancel,
            handle,
            _watcher: watcher,
        })
    }

    /// Stops new reconciles; an in-flight reconcile completes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

fn conversation_id_of(path: &PathBuf) -> Option<String> {
    if path.extension()?.to_str()? != "jsonl" {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

struct PendingEntry {
    due: tokio::time::Instant,
    retries: u32,
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    debounce: Duration,
    reconciler: Arc<dyn Reconcile>,
    pending_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<String, PendingEntry> = HashMap::new();

    loop {
        let next_due = pending.values().map(|e| e.due).min();
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(id) => {
                        debug!(conversation = id.as_str(), "log change observed");
                        let retries = pending.get(&id).map(|e| e.retries).unwrap_or(0);
                        pending.insert(id, PendingEntry {
                            due: tokio::time::Instant::now() + debounce,
                            retries,
                        });
                        pending_count.store(pending.len(), Ordering::SeqCst);
                    }
                    None => break,
                }
            }
            _ = sleep_until_opt(next_due), if next_due.is_some() => {
                let now = tokio::time::Instant::now();
                let due_ids: Vec<String> = pending
                    .iter()
                    .filter(|(_, e)| e.due <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in due_ids {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let retries = pending.get(&id).map(|e| e.retries).unwrap_or(0);
                    match reconciler.reconcile(&id).await {
                        Ok(outcome) => {
                            debug!(conversation = id.as_str(), ?outcome, "reconciled");
                            pending.remove(&id);
                        }
                        Err(e) => {
                            let backoff = backoff_after(debounce, retries);
                            warn!(
                                conversation = id.as_str(),
                                retries,
                                "reconcile failed, retrying in {backoff:?}: {e}"
                            );
                            pending.insert(id, PendingEntry {
                                due: tokio::time::Instant::now() + backoff,
                                retries: retries + 1,
                            });
                        }
                    }
                    pending_count.store(pending.len(), Ordering::SeqCst);
                }
            }
        }
    }
    pending_count.store(0, Ordering::SeqCst);
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn backoff_after(debounce: Duration, retries: u32) -> Duration {
    let factor = 2u32.saturating_pow(retries.min(16));
    debounce.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_paths_map_to_conversation_ids() {
        assert_eq!(
            conversation_id_of(&PathBuf::from("/logs/c1.jsonl")),
            Some("c1".to_string())
        );
        assert_eq!(conversation_id_of(&PathBuf::from("/logs/c1.tmp")), None);
        assert_eq!(conversation_id_of(&PathBuf::from("/logs")), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let d = Duration::from_millis(500);
        assert_eq!(backoff_after(d, 0), Duration::from_millis(500));
        assert_eq!(backoff_after(d, 1), Duration::from_secs(1));
        assert_eq!(backoff_after(d, 2), Duration::from_secs(2));
        assert_eq!(backoff_after(d, 30), MAX_BACKOFF);
    }
}
