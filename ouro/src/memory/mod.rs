//! Memory engine: relational store + FTS indexes + append-only conversation
//! logs + content-addressed embedding cache, kept in sync by a log watcher.
//!
//! The log is the source of truth for conversations; the SQLite mirror is
//! rebuildable from it via [`MemoryEngine::reconcile_conversation`]. All
//! mutation flows through engine methods; the database handle never leaves
//! this module.

mod anomaly;
mod chunk;
mod db;
mod embedding;
mod log;
mod search;
mod types;
mod vector;
mod watcher;

pub use anomaly::{ThresholdPolicy, DEFAULT_BASELINE_WINDOW, DEFAULT_STDDEV_THRESHOLD};
pub use chunk::{
    code_chunks, code_chunks_with, conversation_chunk_id, conversation_chunks, sha256_hex,
    sha256_hex_bytes, CodeChunk, ConversationChunk, CODE_WINDOW_LINES, CODE_WINDOW_OVERLAP,
};
pub use embedding::{Embedder, EmbeddingCache};
pub use log::ConversationLog;
pub use search::{
    SearchHit, SearchResponse, SearchSource, SemanticResponse, HYBRID_KEYWORD_WEIGHT,
    HYBRID_VECTOR_WEIGHT,
};
pub use types::{CodeFile, Conversation, Decision, Metric, Pattern, StoredMessage};
pub use vector::{InMemoryVectorIndex, VectorHit, VectorIndex};
pub use watcher::{LogWatcher, Reconcile, ReconcileOutcome};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::params;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::{Message, Role};

use db::Db;

/// Memory engine failures.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Relational store failure; halts the write that hit it.
    #[error("storage: {0}")]
    Storage(String),
    /// The log append itself failed; the write did not happen.
    #[error("log append: {0}")]
    LogAppend(String),
    /// The log append succeeded but indexing did not; the log is
    /// authoritative and the watcher reconciles.
    #[error("index lagging behind log: {0}")]
    IndexLagging(String),
    #[error("serialization: {0}")]
    Serde(String),
    #[error("invalid conversation id: {0:?}")]
    InvalidId(String),
    #[error("watcher: {0}")]
    Watcher(String),
    #[error("no embedder configured")]
    NoEmbedder,
}

/// Outcome of [`MemoryEngine::index_code_file`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeIndexOutcome {
    /// File hash unchanged; nothing re-indexed.
    Unchanged,
    Indexed {
        chunks_written: usize,
        chunks_removed: usize,
    },
}

/// The durable substrate. One instance per process, shared as `Arc`.
pub struct MemoryEngine {
    db: Db,
    log: ConversationLog,
    cache: EmbeddingCache,
    embedder: Option<Arc<dyn Embedder>>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    pending_reconciles: Arc<AtomicUsize>,
}

impl MemoryEngine {
    /// Opens the engine at the configured paths, creating what is missing.
    pub fn open(cfg: &env_config::MemoryConfig) -> Result<Self, MemoryError> {
        Self::open_at(&cfg.db_path, &cfg.log_dir, cfg.cache_max_size)
    }

    pub fn open_at(
        db_path: impl AsRef<Path>,
        log_dir: impl Into<PathBuf>,
        cache_max_size: usize,
    ) -> Result<Self, MemoryError> {
        let db = Db::open(db_path)?;
        let log = ConversationLog::open(log_dir)?;
        let cache = EmbeddingCache::new(db.clone(), cache_max_size);
        Ok(Self {
            db,
            log,
            cache,
            embedder: None,
            vector_index: None,
            pending_reconciles: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Installs an embedder, enabling semantic search when a vector index is
    /// also present.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Installs a vector index. Absent index means keyword-only semantic
    /// results, flagged in the response.
    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(index);
        self
    }

    pub fn log_dir(&self) -> &Path {
        self.log.dir()
    }

    pub fn embeddings(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Credential rotation hook: stale keys must not stay associated with
    /// cached vectors.
    pub async fn on_key_rotation(&self, provider: &str) -> Result<usize, MemoryError> {
        self.cache.clear_provider(provider, None).await
    }

    // ---- conversation write path ------------------------------------------

    /// Stores one message: append to the log (flushed), then mirror into the
    /// relational store, chunk, and FTS index in a single transaction.
    ///
    /// A log failure fails the whole operation. An index failure after a
    /// successful append returns [`MemoryError::IndexLagging`]; the log
    /// remains authoritative and the watcher reconciles.
    pub async fn store_message(
        &self,
        conversation_id: &str,
        message: &Message,
    ) -> Result<StoredMessage, MemoryError> {
        ConversationLog::validate_id(conversation_id)?;
        let lock = self.log.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let ordinal = self.log.append_locked(conversation_id, message).await?;

        let stored = StoredMessage {
            id: format!("msg_{conversation_id}_{ordinal}"),
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            token_estimate: message.token_estimate,
            metadata: message.metadata.clone(),
        };
        let chunk = chunk::conversation_chunk(conversation_id, ordinal, message);

        let row = stored.clone();
        let conv_id = conversation_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO conversations (id, created_at, updated_at)
                     VALUES (?1, ?2, ?2)
                     ON CONFLICT(id) DO UPDATE SET updated_at = ?2",
                    params![conv_id, now],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO conversation_messages
                       (id, conversation_id, role, content, timestamp, token_estimate, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id,
                        row.conversation_id,
                        row.role.as_str(),
                        row.content,
                        row.timestamp,
                        row.token_estimate.map(|t| t as i64),
                        row.metadata.as_ref().map(|m| m.to_string()),
                    ],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO conversation_chunks
                       (id, conversation_id, ordinal, text, hash)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        chunk.id,
                        row.conversation_id,
                        chunk.ordinal as i64,
                        chunk.text,
                        chunk.hash
                    ],
                )?;
                tx.execute(
                    "DELETE FROM conversation_chunks_fts WHERE id = ?1",
                    params![chunk.id],
                )?;
                tx.execute(
                    "INSERT INTO conversation_chunks_fts (id, conversation_id, text)
                     VALUES (?1, ?2, ?3)",
                    params![chunk.id, row.conversation_id, chunk.text],
                )?;
                tx.commit()
            })
            .await
            .map_err(|e| MemoryError::IndexLagging(e.to_string()))?;

        Ok(stored)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, MemoryError> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, created_at, updated_at, content_hash
                     FROM conversations WHERE id = ?1",
                )?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(r) => Ok(Some(Conversation {
                        id: r.get(0)?,
                        title: r.get(1)?,
                        created_at: r.get(2)?,
                        updated_at: r.get(3)?,
                        content_hash: r.get(4)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Messages mirrored in the store, in conversation order.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let conv = conversation_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, role, content, timestamp, token_estimate, metadata
                     FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY timestamp ASC, rowid ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![conv, limit as i64], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Messages straight from the log file (the source of truth).
    pub async fn read_log(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        self.log.read(conversation_id).await
    }

    // ---- decisions / metrics / patterns -----------------------------------

    pub async fn record_decision(&self, decision: &Decision) -> Result<(), MemoryError> {
        let d = decision.clone();
        let alternatives = serde_json::to_string(&d.alternatives)
            .map_err(|e| MemoryError::Serde(e.to_string()))?;
        let fts_text = format!("{} {} {}", d.context, d.reasoning, d.chosen);
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO decisions
                       (id, timestamp, context, reasoning, alternatives, chosen, outcome, lessons)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        d.id, d.timestamp, d.context, d.reasoning, alternatives, d.chosen,
                        d.outcome, d.lessons
                    ],
                )?;
                tx.execute("DELETE FROM decisions_fts WHERE id = ?1", params![d.id])?;
                tx.execute(
                    "INSERT INTO decisions_fts (id, text) VALUES (?1, ?2)",
                    params![d.id, fts_text],
                )?;
                tx.commit()
            })
            .await
    }

    /// Records the outcome of a decision after the fact; context and
    /// reasoning are append-only and stay untouched.
    pub async fn record_decision_outcome(
        &self,
        id: &str,
        outcome: &str,
        lessons: Option<&str>,
    ) -> Result<(), MemoryError> {
        let id = id.to_string();
        let outcome = outcome.to_string();
        let lessons = lessons.map(str::to_string);
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE decisions SET outcome = ?2, lessons = ?3 WHERE id = ?1",
                    params![id, outcome, lessons],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn record_metric(&self, metric: &Metric) -> Result<(), MemoryError> {
        let m = metric.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO metrics (id, timestamp, metric_type, name, value, context)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![m.id, m.timestamp, m.metric_type, m.name, m.value, m.context],
                )?;
                Ok(())
            })
            .await
    }

    /// Metrics of one type within the trailing window, ascending by time.
    pub async fn metrics_in_window(
        &self,
        metric_type: &str,
        window: Duration,
    ) -> Result<Vec<Metric>, MemoryError> {
        let metric_type = metric_type.to_string();
        let cutoff = chrono::Utc::now().timestamp_millis() - window.as_millis() as i64;
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, metric_type, name, value, context
                     FROM metrics
                     WHERE metric_type = ?1 AND timestamp >= ?2
                     ORDER BY timestamp ASC",
                )?;
                let rows = stmt
                    .query_map(params![metric_type, cutoff], |r| {
                        Ok(Metric {
                            id: r.get(0)?,
                            timestamp: r.get(1)?,
                            metric_type: r.get(2)?,
                            name: r.get(3)?,
                            value: r.get(4)?,
                            context: r.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Metrics in the window that exceed the policy's threshold.
    pub async fn detect_anomalies(
        &self,
        metric_type: &str,
        window: Duration,
        policy: &ThresholdPolicy,
    ) -> Result<Vec<Metric>, MemoryError> {
        let metrics = self.metrics_in_window(metric_type, window).await?;
        Ok(anomaly::detect(&metrics, policy))
    }

    pub async fn upsert_pattern(&self, pattern: &Pattern) -> Result<(), MemoryError> {
        let p = pattern.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO patterns
                       (id, name, category, problem, solution, success_count, failure_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        p.id, p.name, p.category, p.problem, p.solution,
                        p.success_count, p.failure_count
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Outcome feedback on a pattern: bumps its success or failure count.
    pub async fn pattern_feedback(&self, id: &str, success: bool) -> Result<(), MemoryError> {
        let id = id.to_string();
        let column = if success { "success_count" } else { "failure_count" };
        let sql = format!("UPDATE patterns SET {column} = {column} + 1 WHERE id = ?1");
        self.db
            .with(move |conn| {
                conn.execute(&sql, params![id])?;
                Ok(())
            })
            .await
    }

    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>, MemoryError> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, category, problem, solution, success_count, failure_count
                     FROM patterns WHERE id = ?1",
                )?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(r) => Ok(Some(Pattern {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        category: r.get(2)?,
                        problem: r.get(3)?,
                        solution: r.get(4)?,
                        success_count: r.get(5)?,
                        failure_count: r.get(6)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
    }

    // ---- code indexing ----------------------------------------------------

    /// Indexes one source file: upserts the `code_files` row and re-indexes
    /// only chunks whose hash changed. Unchanged files are a no-op.
    pub async fn index_code_file(
        &self,
        repo: &str,
        path: &str,
        language: &str,
        content: &str,
    ) -> Result<CodeIndexOutcome, MemoryError> {
        let file_hash = chunk::sha256_hex_bytes(content.as_bytes());
        let stored: Option<String> = {
            let p = path.to_string();
            self.db
                .with(move |conn| {
                    let mut stmt = conn.prepare("SELECT hash FROM code_files WHERE path = ?1")?;
                    let mut rows = stmt.query(params![p])?;
                    match rows.next()? {
                        Some(r) => Ok(Some(r.get::<_, String>(0)?)),
                        None => Ok(None),
                    }
                })
                .await?
        };
        if stored.as_deref() == Some(file_hash.as_str()) {
            return Ok(CodeIndexOutcome::Unchanged);
        }

        let chunks = chunk::code_chunks(path, content);
        let repo = repo.to_string();
        let path = path.to_string();
        let language = language.to_string();
        let size = content.len() as i64;
        let now = chrono::Utc::now().timestamp_millis();

        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;

                let existing: Vec<(String, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, hash FROM code_chunks WHERE file_path = ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![path], |r| Ok((r.get(0)?, r.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                let desired: std::collections::HashMap<&str, &str> = chunks
                    .iter()
                    .map(|c| (c.id.as_str(), c.hash.as_str()))
                    .collect();

                let mut removed = 0usize;
                for (id, hash) in &existing {
                    if desired.get(id.as_str()) != Some(&hash.as_str()) {
                        tx.execute("DELETE FROM code_chunks WHERE id = ?1", params![id])?;
                        tx.execute("DELETE FROM code_chunks_fts WHERE id = ?1", params![id])?;
                        removed += 1;
                    }
                }

                let existing_map: std::collections::HashMap<String, String> =
                    existing.into_iter().collect();
                let mut written = 0usize;
                for c in &chunks {
                    if existing_map.get(&c.id) == Some(&c.hash) {
                        continue;
                    }
                    let symbols = serde_json::to_string(&c.symbols).unwrap_or_default();
                    let imports = serde_json::to_string(&c.imports).unwrap_or_default();
                    tx.execute(
                        "INSERT OR REPLACE INTO code_chunks
                           (id, file_path, start_line, end_line, text, hash, symbols, imports)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            c.id,
                            path,
                            c.start_line as i64,
                            c.end_line as i64,
                            c.text,
                            c.hash,
                            symbols,
                            imports
                        ],
                    )?;
                    tx.execute("DELETE FROM code_chunks_fts WHERE id = ?1", params![c.id])?;
                    tx.execute(
                        "INSERT INTO code_chunks_fts (id, file_path, text) VALUES (?1, ?2, ?3)",
                        params![c.id, path, c.text],
                    )?;
                    written += 1;
                }

                tx.execute(
                    "INSERT OR REPLACE INTO code_files
                       (path, repo, hash, language, size, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![path, repo, file_hash, language, size, now],
                )?;
                tx.commit()?;
                Ok(CodeIndexOutcome::Indexed {
                    chunks_written: written,
                    chunks_removed: removed,
                })
            })
            .await
    }

    // ---- search -----------------------------------------------------------

    fn is_partial(&self) -> bool {
        self.pending_reconciles.load(Ordering::SeqCst) > 0
    }

    pub async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<SearchResponse, MemoryError> {
        Ok(SearchResponse {
            hits: search::keyword_conversations(&self.db, query, limit).await?,
            partial: self.is_partial(),
        })
    }

    pub async fn search_code(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<SearchResponse, MemoryError> {
        Ok(SearchResponse {
            hits: search::keyword_code(&self.db, query, limit).await?,
            partial: self.is_partial(),
        })
    }

    pub async fn search_decisions(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<SearchResponse, MemoryError> {
        Ok(SearchResponse {
            hits: search::keyword_decisions(&self.db, query, limit).await?,
            partial: self.is_partial(),
        })
    }

    /// Semantic search across every corpus. With no vector index installed,
    /// callers still receive keyword results, flagged.
    pub async fn search_semantic(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<SemanticResponse, MemoryError> {
        let mut keyword = search::keyword_conversations(&self.db, query, limit).await?;
        keyword.extend(search::keyword_code(&self.db, query, limit).await?);
        keyword.extend(search::keyword_decisions(&self.db, query, limit).await?);

        let (Some(embedder), Some(index)) = (&self.embedder, &self.vector_index) else {
            let mut hits = keyword;
            hits.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(limit);
            return Ok(SemanticResponse {
                hits,
                vector_index_missing: true,
                partial: self.is_partial(),
            });
        };

        let vector = self.embed_cached(query, embedder.as_ref()).await?;
        let vector_hits = index
            .query(&vector, limit)
            .await?
            .into_iter()
            .map(|h| SearchHit {
                id: h.id,
                source: SearchSource::Conversations,
                score: f64::from(h.score),
                content: h.content,
                metadata: h.metadata,
            })
            .collect();

        Ok(SemanticResponse {
            hits: search::merge_hybrid(vector_hits, keyword, limit),
            vector_index_missing: false,
            partial: self.is_partial(),
        })
    }

    async fn embed_cached(
        &self,
        text: &str,
        embedder: &dyn Embedder,
    ) -> Result<Vec<f32>, MemoryError> {
        let provider = embedder.provider().to_string();
        let model = embedder.model().to_string();
        if let Some(v) = self.cache.get(text, &provider, &model).await? {
            return Ok(v);
        }
        let mut vectors = embedder.embed(&[text]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| MemoryError::Serde("embedder returned no vector".into()))?;
        self.cache.set(text, &provider, &model, &vector).await?;
        Ok(vector)
    }

    // ---- reconciliation ---------------------------------------------------

    /// Re-syncs one conversation's index from its log file. Idempotent: when
    /// the stored hash matches the file, nothing happens; otherwise chunks
    /// are diffed by content hash and only the difference is written.
    pub async fn reconcile_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ReconcileOutcome, MemoryError> {
        ConversationLog::validate_id(conversation_id)?;
        let lock = self.log.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let path = self.log.path_for(conversation_id);
        let conv = conversation_id.to_string();

        let outcome = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || reconcile_blocking(&db, &path, &conv))
                .await
                .map_err(|e| MemoryError::Storage(e.to_string()))??
        };
        self.log.invalidate_count(conversation_id);
        Ok(outcome)
    }

    /// Spawns the log watcher. The watcher holds only a weak handle to the
    /// engine, so dropping the engine stops reconciliation naturally.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Result<LogWatcher, MemoryError> {
        let reconciler = Arc::new(EngineReconciler {
            engine: Arc::downgrade(self),
        });
        LogWatcher::spawn(
            self.log.dir(),
            debounce,
            reconciler,
            Arc::clone(&self.pending_reconciles),
            cancel,
        )
    }
}

fn reconcile_blocking(
    db: &Db,
    path: &Path,
    conversation_id: &str,
) -> Result<ReconcileOutcome, MemoryError> {
    let bytes = if path.exists() {
        std::fs::read(path).map_err(|e| MemoryError::LogAppend(e.to_string()))?
    } else {
        Vec::new()
    };
    let file_hash = chunk::sha256_hex_bytes(&bytes);

    let stored_hash: Option<String> = {
        let conv = conversation_id.to_string();
        db.with_blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT content_hash FROM conversations WHERE id = ?1")?;
            let mut rows = stmt.query(params![conv])?;
            match rows.next()? {
                Some(r) => Ok(r.get::<_, Option<String>>(0)?),
                None => Ok(None),
            }
        })?
    };
    if stored_hash.as_deref() == Some(file_hash.as_str()) {
        return Ok(ReconcileOutcome::Skipped);
    }

    let content = String::from_utf8_lossy(&bytes);
    let mut messages = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(m) => messages.push(m),
            Err(e) => {
                debug!(conversation = conversation_id, "skipping malformed line: {e}")
            }
        }
    }
    let desired = chunk::conversation_chunks(conversation_id, &messages);

    let conv = conversation_id.to_string();
    let now = chrono::Utc::now().timestamp_millis();
    db.with_blocking(move |conn| {
        let tx = conn.transaction()?;

        let existing: Vec<(String, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, hash FROM conversation_chunks WHERE conversation_id = ?1")?;
            let rows = stmt
                .query_map(params![conv], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let desired_map: std::collections::HashMap<&str, &str> = desired
            .iter()
            .map(|c| (c.id.as_str(), c.hash.as_str()))
            .collect();
        let existing_map: std::collections::HashMap<String, String> =
            existing.iter().cloned().collect();

        let mut deleted = 0usize;
        for (id, hash) in &existing {
            if desired_map.get(id.as_str()) != Some(&hash.as_str()) {
                tx.execute("DELETE FROM conversation_chunks WHERE id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM conversation_chunks_fts WHERE id = ?1",
                    params![id],
                )?;
                let msg_id = id.replacen("chunk_", "msg_", 1);
                tx.execute(
                    "DELETE FROM conversation_messages WHERE id = ?1",
                    params![msg_id],
                )?;
                deleted += 1;
            }
        }

        let mut inserted = 0usize;
        for (chunk, message) in desired.iter().zip(messages.iter()) {
            if existing_map.get(&chunk.id) == Some(&chunk.hash) {
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO conversation_chunks
                   (id, conversation_id, ordinal, text, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chunk.id, conv, chunk.ordinal as i64, chunk.text, chunk.hash],
            )?;
            tx.execute(
                "DELETE FROM conversation_chunks_fts WHERE id = ?1",
                params![chunk.id],
            )?;
            tx.execute(
                "INSERT INTO conversation_chunks_fts (id, conversation_id, text)
                 VALUES (?1, ?2, ?3)",
                params![chunk.id, conv, chunk.text],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO conversation_messages
                   (id, conversation_id, role, content, timestamp, token_estimate, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    format!("msg_{}_{}", conv, chunk.ordinal),
                    conv,
                    message.role.as_str(),
                    message.content,
                    message.timestamp,
                    message.token_estimate.map(|t| t as i64),
                    message.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            inserted += 1;
        }

        tx.execute(
            "INSERT INTO conversations (id, created_at, updated_at, content_hash)
             VALUES (?1, ?2, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET updated_at = ?2, content_hash = ?3",
            params![conv, now, file_hash],
        )?;
        tx.commit()?;
        Ok(ReconcileOutcome::Applied { inserted, deleted })
    })
}

/// Watcher-facing adapter; holds the engine weakly.
struct EngineReconciler {
    engine: Weak<MemoryEngine>,
}

#[async_trait]
impl Reconcile for EngineReconciler {
    async fn reconcile(&self, conversation_id: &str) -> Result<ReconcileOutcome, MemoryError> {
        match self.engine.upgrade() {
            Some(engine) => engine.reconcile_conversation(conversation_id).await,
            // Engine gone during shutdown; treat as settled.
            None => Ok(ReconcileOutcome::Skipped),
        }
    }
}

fn row_to_message(r: &rusqlite::Row<'_>) -> Result<StoredMessage, rusqlite::Error> {
    let role_str: String = r.get(2)?;
    let role = match role_str.as_str() {
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    };
    let metadata: Option<String> = r.get(6)?;
    let token_estimate: Option<i64> = r.get(5)?;
    Ok(StoredMessage {
        id: r.get(0)?,
        conversation_id: r.get(1)?,
        role,
        content: r.get(3)?,
        timestamp: r.get(4)?,
        token_estimate: token_estimate.map(|t| t as u32),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}
