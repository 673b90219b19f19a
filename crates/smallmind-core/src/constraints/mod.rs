//! Optional per-step decoding constraints.
//!
//! A constraint inspects the text generated so far (and, for grammar-backed
//! constraints, a parser state) and returns a vocabulary bitmask of which
//! next tokens remain feasible, plus whether the constraint has reached a
//! complete match.

pub mod grammar;
pub mod regex_enforcer;

pub use grammar::GrammarConstraint;
pub use regex_enforcer::RegexConstraint;

use crate::tokenizer::Vocab;

/// Outcome of evaluating a constraint for the next token.
pub struct ConstraintStep {
    /// `mask[id]` is `true` when token `id` may legally be emitted next.
    pub mask: Vec<bool>,
    /// Whether the constraint has reached a terminal complete state.
    pub complete: bool,
}

/// Common interface both concrete constraint types implement.
pub trait Constraint {
    /// Compute the feasibility mask and completion flag given the text
    /// generated so far (not including the candidate next token).
    fn step(&mut self, generated_so_far: &str, vocab: &Vocab) -> ConstraintStep;
}
