//! Chunking: the unit of indexable text.
//!
//! Conversations chunk one-per-message with stable ids
//! `chunk_{conversation}_{ordinal}` and text `"{role}: {content}"`. Code
//! chunks by a sliding line window with fixed overlap, plus a per-file
//! extraction of top-level symbols and imports attached to every chunk as
//! metadata. Every chunk carries a SHA-256 content hash so unchanged text is
//! never re-indexed.

use sha2::{Digest, Sha256};

use crate::message::Message;

/// Default code window height, in lines.
pub const CODE_WINDOW_LINES: usize = 40;
/// Default overlap between consecutive code windows, in lines.
pub const CODE_WINDOW_OVERLAP: usize = 10;

/// Hex SHA-256 of a string.
pub fn sha256_hex(text: &str) -> String {
    sha256_hex_bytes(text.as_bytes())
}

/// Hex SHA-256 of raw bytes.
pub fn sha256_hex_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// A conversation chunk: one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationChunk {
    pub id: String,
    pub ordinal: u64,
    pub text: String,
    pub hash: String,
}

/// Chunk id for a conversation message.
pub fn conversation_chunk_id(conversation_id: &str, ordinal: u64) -> String {
    format!("chunk_{conversation_id}_{ordinal}")
}

/// Builds the chunk for one message at a given ordinal.
pub fn conversation_chunk(
    conversation_id: &str,
    ordinal: u64,
    message: &Message,
) -> ConversationChunk {
    let text = format!("{}: {}", message.role, message.content);
    let hash = sha256_hex(&text);
    ConversationChunk {
        id: conversation_chunk_id(conversation_id, ordinal),
        ordinal,
        text,
        hash,
    }
}

/// Chunks derived from a whole log file, in order.
pub fn conversation_chunks(conversation_id: &str, messages: &[Message]) -> Vec<ConversationChunk> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| conversation_chunk(conversation_id, i as u64, m))
        .collect()
}

/// A code chunk: a line window plus file-level symbol/import metadata.
#[derive(Clone, Debug)]
pub struct CodeChunk {
    pub id: String,
    pub start_line: u64,
    pub end_line: u64,
    pub text: String,
    pub hash: String,
    pub symbols: Vec<String>,
    pub imports: Vec<String>,
}

/// Sliding-window code chunking with the default window/overlap.
pub fn code_chunks(file_path: &str, source: &str) -> Vec<CodeChunk> {
    code_chunks_with(file_path, source, CODE_WINDOW_LINES, CODE_WINDOW_OVERLAP)
}

/// Sliding-window code chunking. Windows advance by `window - overlap`
/// lines; the symbols and imports extracted from the whole file ride along
/// on every chunk.
pub fn code_chunks_with(
    file_path: &str,
    source: &str,
    window: usize,
    overlap: usize,
) -> Vec<CodeChunk> {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);
    let symbols = extract_symbols(&lines);
    let imports = extract_imports(&lines);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0u64;
    loop {
        let end = (start + window).min(lines.len());
        let text = lines[start..end].join("\n");
        let hash = sha256_hex(&text);
        chunks.push(CodeChunk {
            id: format!("code_{}_{}", sha256_hex(file_path), ordinal),
            start_line: start as u64 + 1,
            end_line: end as u64,
            text,
            hash,
            symbols: symbols.clone(),
            imports: imports.clone(),
        });
        if end == lines.len() {
            break;
        }
        start += step;
        ordinal += 1;
    }
    chunks
}

/// Top-level symbol names, by a language-agnostic prefix heuristic.
fn extract_symbols(lines: &[&str]) -> Vec<String> {
    const HEADS: &[&str] = &[
        "fn ", "pub fn ", "struct ", "pub struct ", "enum ", "pub enum ", "trait ",
        "pub trait ", "impl ", "class ", "def ", "function ", "const ", "pub const ",
        "type ", "pub type ", "interface ",
    ];
    let mut out = Vec::new();
    for line in lines {
        // Top-level only: indented declarations are members.
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        for head in HEADS {
            if let Some(rest) = line.strip_prefix(head) {
                if let Some(name) = first_identifier(rest) {
                    out.push(name);
                }
                break;
            }
        }
    }
    out.dedup();
    out
}

/// Import targets, by line prefix.
fn extract_imports(lines: &[&str]) -> Vec<String> {
    const HEADS: &[&str] = &["use ", "import ", "from ", "#include ", "require "];
    let mut out = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        for head in HEADS {
            if let Some(rest) = trimmed.strip_prefix(head) {
                let target = rest
                    .trim_end_matches(';')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string();
                if !target.is_empty() {
                    out.push(target);
                }
                break;
            }
        }
    }
    out.dedup();
    out
}

fn first_identifier(s: &str) -> Option<String> {
    let name: String = s
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}
