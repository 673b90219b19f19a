//! Byte-Pair Encoding.
//!
//! Two construction modes share the same merge engine: classic BPE operates
//! on UTF-8 characters, byte-level BPE first maps each raw byte through a
//! reversible byte/unicode alias (GPT-2's `bytes_to_unicode`) so that every
//! byte sequence, including invalid UTF-8, has a representable token chain.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::vocab::{MergeTable, Vocab};
use crate::error::{EngineError, Result};

/// GPT-2-style pre-tokenization regex: contractions, letter runs, digit
/// runs, punctuation runs, and whitespace runs. Supplied verbatim by the
/// model in a complete loader; this is the default when none is declared.
const DEFAULT_PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

fn default_pretokenize_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DEFAULT_PRETOKENIZE_PATTERN).expect("valid built-in regex"))
}

/// Whether raw bytes are mapped through the byte/unicode alias before BPE,
/// or the input is split directly into UTF-8 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpeMode {
    /// Characters are BPE units directly.
    Classic,
    /// Bytes are aliased to printable unicode code points first.
    ByteLevel,
}

fn byte_to_unicode() -> &'static [char; 256] {
    static TABLE: OnceLock<[char; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend(b'!'..=b'~');
        bytes.extend(0xA1u8..=0xACu8);
        bytes.extend(0xAEu8..=0xFFu8);
        let mut table = [' '; 256];
        let mut n = 0u32;
        for b in 0u16..256 {
            let b = b as u8;
            if bytes.contains(&b) {
                table[b as usize] = b as char;
            } else {
                table[b as usize] = char::from_u32(256 + n).unwrap();
                n += 1;
            }
        }
        table
    })
}

fn unicode_to_byte() -> &'static HashMap<char, u8> {
    static MAP: OnceLock<HashMap<char, u8>> = OnceLock::new();
    MAP.get_or_init(|| {
        byte_to_unicode()
            .iter()
            .enumerate()
            .map(|(b, c)| (*c, b as u8))
            .collect()
    })
}

/// A compiled BPE tokenizer: pre-tokenization regex, merge ranks, and the
/// vocabulary the merges produce ids from.
pub struct BpeTokenizer {
    mode: BpeMode,
    pretokenize: Regex,
    merges: MergeTable,
    vocab: Vocab,
}

impl BpeTokenizer {
    /// Construct a tokenizer from a vocabulary, ordered merge list, mode,
    /// and an optional model-provided pre-tokenization pattern (falls back
    /// to the GPT-2-style default when `None`).
    pub fn new(
        vocab: Vocab,
        merges: Vec<(String, String)>,
        mode: BpeMode,
        pretokenize_pattern: Option<&str>,
    ) -> Result<Self> {
        let pretokenize = match pretokenize_pattern {
            Some(pat) => Regex::new(pat)
                .map_err(|e| EngineError::InvalidModel(format!("invalid pre-tokenization regex: {e}")))?,
            None => default_pretokenize_regex().clone(),
        };
        Ok(Self {
            mode,
            pretokenize,
            merges: MergeTable::new(merges),
            vocab,
        })
    }

    /// The vocabulary backing this tokenizer.
    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Encode `text` into a sequence of token ids.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for unit in self.pretokenize.find_iter(text) {
            let symbols = self.unit_to_symbols(unit.as_str());
            let merged = bpe_merge(symbols, &self.merges);
            for sym in merged {
                ids.push(self.vocab.require_id(&sym)?);
            }
        }
        Ok(ids)
    }

    fn unit_to_symbols(&self, unit: &str) -> Vec<String> {
        match self.mode {
            BpeMode::Classic => unit.chars().map(String::from).collect(),
            BpeMode::ByteLevel => {
                let table = byte_to_unicode();
                unit.as_bytes()
                    .iter()
                    .map(|&b| table[b as usize].to_string())
                    .collect()
            }
        }
    }

    /// Decode a sequence of token ids back into a string.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut alias = String::new();
        for &id in ids {
            let tok = self
                .vocab
                .token(id)
                .ok_or_else(|| EngineError::InvalidModel(format!("unknown token id {id}")))?;
            alias.push_str(tok);
        }
        match self.mode {
            BpeMode::Classic => Ok(alias),
            BpeMode::ByteLevel => {
                let map = unicode_to_byte();
                let bytes: Vec<u8> = alias
                    .chars()
                    .map(|c| {
                        map.get(&c).copied().ok_or_else(|| {
                            EngineError::InvalidModel(format!("byte-level alias char '{c}' unknown"))
                        })
                    })
                    .collect::<Result<_>>()?;
                String::from_utf8(bytes)
                    .map_err(|_| EngineError::InvalidModel("decoded bytes are not valid UTF-8".into()))
            }
        }
    }
}

/// Apply BPE merges to `symbols` until no mergeable adjacent pair remains.
///
/// Each round finds the lowest-rank adjacent pair present anywhere in the
/// current symbol list, then rebuilds the list in a single forward scan,
/// merging every non-overlapping occurrence of that pair (left-most wins on
/// overlap). This avoids the O(n²) blowup of repeatedly calling `Vec::remove`
/// on a shrinking-by-one buffer: each round is one allocation and one linear
/// pass, and the number of rounds is bounded by the word length.
fn bpe_merge(mut symbols: Vec<String>, merges: &MergeTable) -> Vec<String> {
    if symbols.len() < 2 {
        return symbols;
    }
    loop {
        let mut best: Option<(u32, usize)> = None;
        for i in 0..symbols.len() - 1 {
            if let Some(rank) = merges.rank(&symbols[i], &symbols[i + 1]) {
                if best.map(|(r, _)| rank < r).unwrap_or(true) {
                    best = Some((rank, i));
                }
            }
        }
        let Some((rank, _)) = best else {
            break;
        };

        let mut rebuilt = Vec::with_capacity(symbols.len());
        let mut i = 0;
        while i < symbols.len() {
            if i + 1 < symbols.len() && merges.rank(&symbols[i], &symbols[i + 1]) == Some(rank) {
                rebuilt.push(format!("{}{}", symbols[i], symbols[i + 1]));
                i += 2;
            } else {
                rebuilt.push(std::mem::take(&mut symbols[i]));
                i += 1;
            }
        }
        symbols = rebuilt;
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_vocab_and_merges() -> (Vocab, Vec<(String, String)>) {
        let tokens = vec!["l", "o", "w", "e", "r", "lo", "low", "er"]
            .into_iter()
            .map(String::from)
            .collect();
        let merges = vec![
            ("l".to_string(), "o".to_string()),
            ("lo".to_string(), "w".to_string()),
            ("e".to_string(), "r".to_string()),
        ];
        (Vocab::new(tokens), merges)
    }

    #[test]
    fn bpe_merge_applies_in_rank_order() {
        let (_, merges) = tiny_vocab_and_merges();
        let merges = MergeTable::new(merges);
        let symbols: Vec<String> = "low".chars().map(String::from).collect();
        let merged = bpe_merge(symbols, &merges);
        assert_eq!(merged, vec!["low".to_string()]);
    }

    #[test]
    fn bpe_merge_is_noop_with_no_applicable_rules() {
        let merges = MergeTable::new(vec![]);
        let symbols: Vec<String> = "xyz".chars().map(String::from).collect();
        let merged = bpe_merge(symbols, &merges);
        assert_eq!(merged, vec!["x", "y", "z"]);
    }

    #[test]
    fn classic_encode_decode_round_trips() {
        let (vocab, merges) = tiny_vocab_and_merges();
        let tok = BpeTokenizer::new(vocab, merges, BpeMode::Classic, Some(r"\S+|\s+")).unwrap();
        let ids = tok.encode("low").unwrap();
        let text = tok.decode(&ids).unwrap();
        assert_eq!(text, "low");
    }

    #[test]
    fn byte_level_round_trips_arbitrary_utf8() {
        let bytes_used: Vec<String> = "hi \u{1F600}".bytes().map(|b| byte_to_unicode()[b as usize].to_string()).collect();
        let mut tokens: Vec<String> = bytes_used.clone();
        tokens.dedup();
        let vocab = Vocab::new(tokens);
        let tok = BpeTokenizer::new(vocab, vec![], BpeMode::ByteLevel, Some(r"(?s).")).unwrap();
        let ids = tok.encode("hi \u{1F600}").unwrap();
        let text = tok.decode(&ids).unwrap();
        assert_eq!(text, "hi \u{1F600}");
    }
}
