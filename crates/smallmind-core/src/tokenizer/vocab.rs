//! Vocabulary and merge-rank table shared by both BPE construction modes.

use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Ordered vocabulary: token id is the index into `tokens`. Byte-level BPE
/// stores each token's *alias* string (bytes mapped through the reversible
/// byte/unicode alias table); classic BPE stores the literal UTF-8 text.
pub struct Vocab {
    tokens: Vec<String>,
    id_of: HashMap<String, u32>,
}

impl Vocab {
    /// Build a vocabulary from an ordered token list; id = index.
    pub fn new(tokens: Vec<String>) -> Self {
        let id_of = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self { tokens, id_of }
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token text for `id`.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Id for an exact token string.
    pub fn id(&self, token: &str) -> Option<u32> {
        self.id_of.get(token).copied()
    }

    /// Look up a token id, erroring with [`EngineError::InvalidModel`] if absent.
    pub fn require_id(&self, token: &str) -> Result<u32> {
        self.id(token)
            .ok_or_else(|| EngineError::InvalidModel(format!("vocabulary has no token '{token}'")))
    }
}

/// Merge rules: pair `(left, right)` -> priority rank, lower is higher
/// priority. Stored both as an ordered list (for deterministic rebuilding)
/// and a lookup map.
pub struct MergeTable {
    rank_of: HashMap<(String, String), u32>,
}

impl MergeTable {
    /// Build from an ordered list of merge pairs; earlier pairs get lower
    /// (higher-priority) ranks.
    pub fn new(ordered_pairs: Vec<(String, String)>) -> Self {
        let rank_of = ordered_pairs
            .into_iter()
            .enumerate()
            .map(|(i, pair)| (pair, i as u32))
            .collect();
        Self { rank_of }
    }

    /// Priority rank of merging `left` and `right`, if such a merge exists.
    pub fn rank(&self, left: &str, right: &str) -> Option<u32> {
        self.rank_of.get(&(left.to_string(), right.to_string())).copied()
    }
}
