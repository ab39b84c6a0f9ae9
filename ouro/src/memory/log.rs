//! Append-only conversation logs.
//!
//! One JSON-lines file per conversation under the log directory; the log is
//! the source of truth, the relational store a rebuildable mirror. Appends
//! are flushed and synced before returning, and serialized per conversation
//! by an in-memory lock. The same lock is shared with watcher reconciliation
//! so an append and a reconcile of one conversation never interleave.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::message::Message;

use super::MemoryError;

/// Per-conversation JSONL logs with per-id append serialization.
pub struct ConversationLog {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Cached line counts; the next ordinal for a conversation.
    line_counts: DashMap<String, u64>,
}

impl ConversationLog {
    /// Ensures the log directory exists.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MemoryError::LogAppend(format!("create log dir: {e}")))?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
            line_counts: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Conversation ids must be usable as file stems.
    pub fn validate_id(id: &str) -> Result<(), MemoryError> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.starts_with('.')
        {
            return Err(MemoryError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{conversation_id}.jsonl"))
    }

    /// The per-conversation lock, shared between appends and reconciles.
    pub fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends one message, flushed and synced before returning. The caller
    /// must hold the conversation's lock. Returns the message's ordinal (its
    /// zero-based line index).
    pub async fn append_locked(
        &self,
        conversation_id: &str,
        message: &Message,
    ) -> Result<u64, MemoryError> {
        Self::validate_id(conversation_id)?;
        let path = self.path_for(conversation_id);
        let ordinal = match self.line_counts.get(conversation_id) {
            Some(n) => *n,
            None => count_lines(&path)?,
        };

        let line = serde_json::to_string(message)
            .map_err(|e| MemoryError::Serde(e.to_string()))?;
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MemoryError> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&write_path)
                .map_err(|e| MemoryError::LogAppend(e.to_string()))?;
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.flush())
                .and_then(|_| file.sync_all())
                .map_err(|e| MemoryError::LogAppend(e.to_string()))
        })
        .await
        .map_err(|e| MemoryError::LogAppend(e.to_string()))??;

        self.line_counts
            .insert(conversation_id.to_string(), ordinal + 1);
        Ok(ordinal)
    }

    /// Reads all messages of a conversation, in file order. Malformed lines
    /// are skipped with a warning so one bad record cannot poison the log.
    pub async fn read(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        Self::validate_id(conversation_id)?;
        let path = self.path_for(conversation_id);
        let id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || read_messages(&path, &id))
            .await
            .map_err(|e| MemoryError::LogAppend(e.to_string()))?
    }

    /// Drops the cached line count for a conversation, forcing a recount on
    /// the next append. Called after external edits are reconciled.
    pub fn invalidate_count(&self, conversation_id: &str) {
        self.line_counts.remove(conversation_id);
    }
}

/// Reads and parses a log file directly; used by reconciliation, which works
/// from the file on disk rather than the engine's caches.
pub fn read_messages(path: &Path, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| MemoryError::LogAppend(e.to_string()))?;
    let mut out = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => out.push(msg),
            Err(e) => warn!(
                conversation = conversation_id,
                line = lineno + 1,
                "skipping malformed log line: {e}"
            ),
        }
    }
    Ok(out)
}

fn count_lines(path: &Path) -> Result<u64, MemoryError> {
    if !path.exists() {
        return Ok(0);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| MemoryError::LogAppend(e.to_string()))?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[tokio::test]
    async fn append_assigns_sequential_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::open(dir.path()).unwrap();
        let lock = log.lock_for("c1");
        let _g = lock.lock().await;

        let a = log.append_locked("c1", &Message::user("one")).await.unwrap();
        let b = log
            .append_locked("c1", &Message::assistant("two"))
            .await
            .unwrap();
        assert_eq!((a, b), (0, 1));

        let messages = log.read("c1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "one");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn ordinal_resumes_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("c2.jsonl"),
            "{\"role\":\"user\",\"content\":\"old\",\"timestamp\":1}\n",
        )
        .unwrap();
        let log = ConversationLog::open(dir.path()).unwrap();
        let lock = log.lock_for("c2");
        let _g = lock.lock().await;
        let ordinal = log.append_locked("c2", &Message::user("new")).await.unwrap();
        assert_eq!(ordinal, 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("c3.jsonl"),
            "{\"role\":\"user\",\"content\":\"good\",\"timestamp\":1}\nnot json\n",
        )
        .unwrap();
        let log = ConversationLog::open(dir.path()).unwrap();
        let messages = log.read("c3").await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn ids_with_path_tricks_are_rejected() {
        for bad in ["", "../x", "a/b", "a\\b", ".hidden"] {
            assert!(ConversationLog::validate_id(bad).is_err(), "{bad:?}");
        }
        assert!(ConversationLog::validate_id("conv_01").is_ok());
    }
}
