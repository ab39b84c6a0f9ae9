//! Content-addressed embedding cache.
//!
//! Vectors are keyed by `(provider, model, SHA-256(text))` and stored in the
//! `embedding_cache` table as JSON float arrays. `get` touches
//! `last_accessed_at`, which is what makes eviction LRU rather than FIFO;
//! `set` evicts by ascending access time once the entry count exceeds the
//! configured bound.

use async_trait::async_trait;
use rusqlite::params;

use super::chunk::sha256_hex;
use super::db::Db;
use super::MemoryError;

/// Produces fixed-size float vectors from text.
///
/// Implementations can wrap an embeddings API or a local model; tests use a
/// deterministic stub. `provider()` and `model()` name the cache partition
/// vectors land in.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order, each of [`Embedder::dimension`].
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError>;

    fn dimension(&self) -> usize;

    fn provider(&self) -> &str;

    fn model(&self) -> &str;
}

/// The durable cache. Cheap to clone; all clones share the database handle.
#[derive(Clone)]
pub struct EmbeddingCache {
    db: Db,
    max_size: usize,
}

impl EmbeddingCache {
    pub(crate) fn new(db: Db, max_size: usize) -> Self {
        Self { db, max_size }
    }

    /// Cached vector for `(provider, model, sha256(text))`, touching its
    /// access time.
    pub async fn get(
        &self,
        text: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, MemoryError> {
        let hash = sha256_hex(text);
        let provider = provider.to_string();
        let model = model.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let raw: Option<String> = self
            .db
            .with(move |conn| {
                conn.execute(
                    "UPDATE embedding_cache SET last_accessed_at = ?1
                     WHERE provider = ?2 AND model = ?3 AND content_hash = ?4",
                    params![now, provider, model, hash],
                )?;
                let mut stmt = conn.prepare(
                    "SELECT vector FROM embedding_cache
                     WHERE provider = ?1 AND model = ?2 AND content_hash = ?3",
                )?;
                let mut rows = stmt.query(params![provider, model, hash])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match raw {
            Some(json) => {
                let vector: Vec<f32> =
                    serde_json::from_str(&json).map_err(|e| MemoryError::Serde(e.to_string()))?;
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    /// Upserts a vector, then evicts least-recently-accessed entries while
    /// the cache exceeds its bound.
    pub async fn set(
        &self,
        text: &str,
        provider: &str,
        model: &str,
        vector: &[f32],
    ) -> Result<(), MemoryError> {
        let hash = sha256_hex(text);
        let provider = provider.to_string();
        let model = model.to_string();
        let json =
            serde_json::to_string(vector).map_err(|e| MemoryError::Serde(e.to_string()))?;
        let dims = vector.len() as i64;
        let now = chrono::Utc::now().timestamp_millis();
        let max_size = self.max_size as i64;

        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO embedding_cache
                       (provider, model, content_hash, vector, dims, created_at, last_accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(provider, model, content_hash)
                     DO UPDATE SET vector = ?4, dims = ?5, last_accessed_at = ?6",
                    params![provider, model, hash, json, dims, now],
                )?;
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;
                if count > max_size {
                    conn.execute(
                        "DELETE FROM embedding_cache WHERE rowid IN (
                             SELECT rowid FROM embedding_cache
                             ORDER BY last_accessed_at ASC LIMIT ?1
                         )",
                        params![count - max_size],
                    )?;
                }
                Ok(())
            })
            .await
    }

    pub async fn has(&self, text: &str, provider: &str, model: &str) -> Result<bool, MemoryError> {
        let hash = sha256_hex(text);
        let provider = provider.to_string();
        let model = model.to_string();
        self.db
            .with(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM embedding_cache
                     WHERE provider = ?1 AND model = ?2 AND content_hash = ?3",
                    params![provider, model, hash],
                    |r| r.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Drops every entry for a provider, or for one of its models. Invoked
    /// on credential rotation so stale keys are never associated with cached
    /// vectors.
    pub async fn clear_provider(
        &self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<usize, MemoryError> {
        let provider = provider.to_string();
        let model = model.map(str::to_string);
        self.db
            .with(move |conn| {
                let n = match model {
                    Some(m) => conn.execute(
                        "DELETE FROM embedding_cache WHERE provider = ?1 AND model = ?2",
                        params![provider, m],
                    )?,
                    None => conn.execute(
                        "DELETE FROM embedding_cache WHERE provider = ?1",
                        params![provider],
                    )?,
                };
                Ok(n)
            })
            .await
    }

    /// Deletes entries older than `max_age_ms` (by creation time).
    pub async fn clean_expired(&self, max_age_ms: u64) -> Result<usize, MemoryError> {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age_ms as i64;
        self.db
            .with(move |conn| {
                let n = conn.execute(
                    "DELETE FROM embedding_cache WHERE created_at < ?1",
                    params![cutoff],
                )?;
                Ok(n)
            })
            .await
    }

    pub async fn len(&self) -> Result<usize, MemoryError> {
        self.db
            .with(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;
                Ok(n as usize)
            })
            .await
    }

    pub async fn is_empty(&self) -> Result<bool, MemoryError> {
        Ok(self.len().await? == 0)
    }
}
