//! Tokenization: pre-tokenization regex split plus Byte-Pair Encoding merge.

pub mod bpe;
pub mod vocab;

pub use bpe::{BpeMode, BpeTokenizer};
pub use vocab::{MergeTable, Vocab};
