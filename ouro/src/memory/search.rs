//! Search over conversations, code, and decisions.
//!
//! Keyword search rides the FTS5 indexes; the score is `-bm25(...)`, which
//! lands in the positive reals (bm25 is more negative for better matches).
//! Semantic search combines cached embeddings with the optional vector
//! index and merges against keyword hits with a weighted sum.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::db::{fts_match_expr, Db};
use super::MemoryError;

/// Which corpus a hit came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Conversations,
    Code,
    Decisions,
}

/// One ranked hit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub source: SearchSource,
    pub score: f64,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Keyword search results, flagged when the index may lag the log.
#[derive(Clone, Debug, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// True when reconciliation is pending, i.e. results may be missing very
    /// recent writes.
    pub partial: bool,
}

/// Semantic search results; `vector_index_missing` marks keyword-only
/// fallback.
#[derive(Clone, Debug, Default)]
pub struct SemanticResponse {
    pub hits: Vec<SearchHit>,
    pub vector_index_missing: bool,
    pub partial: bool,
}

/// Weight of the vector score in the hybrid merge.
pub const HYBRID_VECTOR_WEIGHT: f64 = 0.6;
/// Weight of the (max-normalized) keyword score in the hybrid merge.
pub const HYBRID_KEYWORD_WEIGHT: f64 = 0.4;

pub(crate) async fn keyword_conversations(
    db: &Db,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, MemoryError> {
    let expr = fts_match_expr(query);
    if expr.is_empty() {
        return Ok(Vec::new());
    }
    db.with(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, text, -bm25(conversation_chunks_fts) AS score
             FROM conversation_chunks_fts
             WHERE conversation_chunks_fts MATCH ?1
             ORDER BY score DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![expr, limit as i64], |r| {
                Ok(SearchHit {
                    id: r.get(0)?,
                    source: SearchSource::Conversations,
                    score: r.get(3)?,
                    content: r.get(2)?,
                    metadata: serde_json::json!({
                        "conversation_id": r.get::<_, String>(1)?,
                    }),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
}

pub(crate) async fn keyword_code(
    db: &Db,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, MemoryError> {
    let expr = fts_match_expr(query);
    if expr.is_empty() {
        return Ok(Vec::new());
    }
    db.with(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT code_chunks_fts.id, code_chunks_fts.file_path, code_chunks_fts.text,
                    -bm25(code_chunks_fts) AS score, c.start_line, c.end_line
             FROM code_chunks_fts
             LEFT JOIN code_chunks c ON c.id = code_chunks_fts.id
             WHERE code_chunks_fts MATCH ?1
             ORDER BY score DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![expr, limit as i64], |r| {
                Ok(SearchHit {
                    id: r.get(0)?,
                    source: SearchSource::Code,
                    score: r.get(3)?,
                    content: r.get(2)?,
                    metadata: serde_json::json!({
                        "file_path": r.get::<_, String>(1)?,
                        "start_line": r.get::<_, Option<i64>>(4)?,
                        "end_line": r.get::<_, Option<i64>>(5)?,
                    }),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
}

pub(crate) async fn keyword_decisions(
    db: &Db,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, MemoryError> {
    let expr = fts_match_expr(query);
    if expr.is_empty() {
        return Ok(Vec::new());
    }
    db.with(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, text, -bm25(decisions_fts) AS score
             FROM decisions_fts
             WHERE decisions_fts MATCH ?1
             ORDER BY score DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![expr, limit as i64], |r| {
                Ok(SearchHit {
                    id: r.get(0)?,
                    source: SearchSource::Decisions,
                    score: r.get(2)?,
                    content: r.get(1)?,
                    metadata: serde_json::Value::Null,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
}

/// Merges vector hits with keyword hits: keyword scores are normalized by
/// their maximum, then each id scores `0.6 * vector + 0.4 * keyword`; hits
/// present on one side only keep that side's weighted score.
pub(crate) fn merge_hybrid(
    vector_hits: Vec<SearchHit>,
    keyword_hits: Vec<SearchHit>,
    limit: usize,
) -> Vec<SearchHit> {
    let max_keyword = keyword_hits
        .iter()
        .map(|h| h.score)
        .fold(0.0_f64, f64::max);

    let mut merged: Vec<SearchHit> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for hit in vector_hits {
        index.insert(hit.id.clone(), merged.len());
        merged.push(SearchHit {
            score: HYBRID_VECTOR_WEIGHT * hit.score,
            ..hit
        });
    }
    for hit in keyword_hits {
        let normalized = if max_keyword > 0.0 {
            hit.score / max_keyword
        } else {
            0.0
        };
        match index.get(&hit.id) {
            Some(&i) => merged[i].score += HYBRID_KEYWORD_WEIGHT * normalized,
            None => merged.push(SearchHit {
                score: HYBRID_KEYWORD_WEIGHT * normalized,
                ..hit
            }),
        }
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}
