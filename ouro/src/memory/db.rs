//! SQLite layer: one database file, single-writer discipline.
//!
//! All tables and both FTS5 indexes live in one file. The connection sits
//! behind a mutex and every operation runs inside `spawn_blocking`, which
//! gives the process-wide write serialization the engine requires; readers
//! queue behind the writer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use super::MemoryError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT PRIMARY KEY,
    title        TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    content_hash TEXT
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    token_estimate  INTEGER,
    metadata        TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON conversation_messages(conversation_id);

CREATE TABLE IF NOT EXISTS conversation_chunks (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    ordinal         INTEGER NOT NULL,
    text            TEXT NOT NULL,
    hash            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_conversation
    ON conversation_chunks(conversation_id);

CREATE VIRTUAL TABLE IF NOT EXISTS conversation_chunks_fts
    USING fts5(id UNINDEXED, conversation_id UNINDEXED, text);

CREATE TABLE IF NOT EXISTS code_files (
    path          TEXT PRIMARY KEY,
    repo          TEXT NOT NULL,
    hash          TEXT NOT NULL,
    language      TEXT NOT NULL,
    size          INTEGER NOT NULL,
    last_modified INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_code_files_repo ON code_files(repo, path);

CREATE TABLE IF NOT EXISTS code_chunks (
    id         TEXT PRIMARY KEY,
    file_path  TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line   INTEGER NOT NULL,
    text       TEXT NOT NULL,
    hash       TEXT NOT NULL,
    symbols    TEXT,
    imports    TEXT
);
CREATE INDEX IF NOT EXISTS idx_code_chunks_file ON code_chunks(file_path);

CREATE VIRTUAL TABLE IF NOT EXISTS code_chunks_fts
    USING fts5(id UNINDEXED, file_path UNINDEXED, text);

CREATE TABLE IF NOT EXISTS decisions (
    id           TEXT PRIMARY KEY,
    timestamp    INTEGER NOT NULL,
    context      TEXT NOT NULL,
    reasoning    TEXT NOT NULL,
    alternatives TEXT NOT NULL,
    chosen       TEXT NOT NULL,
    outcome      TEXT,
    lessons      TEXT
);

CREATE VIRTUAL TABLE IF NOT EXISTS decisions_fts
    USING fts5(id UNINDEXED, text);

CREATE TABLE IF NOT EXISTS metrics (
    id          TEXT PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    metric_type TEXT NOT NULL,
    name        TEXT NOT NULL,
    value       REAL NOT NULL,
    context     TEXT
);
CREATE INDEX IF NOT EXISTS idx_metrics_type_ts ON metrics(metric_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics(name);

CREATE TABLE IF NOT EXISTS patterns (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    category      TEXT NOT NULL,
    problem       TEXT NOT NULL,
    solution      TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS embedding_cache (
    provider         TEXT NOT NULL,
    model            TEXT NOT NULL,
    content_hash     TEXT NOT NULL,
    vector           TEXT NOT NULL,
    dims             INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    PRIMARY KEY (provider, model, content_hash)
);
"#;

/// Shared handle to the memory database.
///
/// Cloning is cheap; every clone serializes through the same mutex.
#[derive(Clone)]
pub(crate) struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Opens (or creates) the database file and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn =
            Connection::open_in_memory().map_err(|e| MemoryError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a closure against the connection on the blocking pool, holding
    /// the single-writer lock for the duration.
    pub async fn with<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn).map_err(|e| MemoryError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| MemoryError::Storage(e.to_string()))?
    }

    /// Synchronous variant for callers already on the blocking pool.
    pub fn with_blocking<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn).map_err(|e| MemoryError::Storage(e.to_string()))
    }
}

/// Builds an FTS5 MATCH expression from free text: each whitespace-separated
/// term is quoted so user input cannot inject FTS syntax.
pub(crate) fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
