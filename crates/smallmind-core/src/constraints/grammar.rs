//! JSON-grammar constraint.
//!
//! Unlike [`super::regex_enforcer::RegexConstraint`], which approximates
//! prefix-feasibility against a compiled pattern, this walks an explicit
//! push-down state over the JSON value grammar one character at a time. The
//! accepted state is cached between calls (`GrammarConstraint::cached_text`/
//! `cached_state`): when `generated_so_far` simply extends the text from the
//! previous call (the normal case inside one generation), only the new
//! suffix is replayed through the cached state, so accepting a token costs
//! work proportional to that token's text rather than the whole history —
//! amortized O(1) per accepted token over a generation, not O(n). Only a
//! diverging `generated_so_far` (text that doesn't extend what was cached,
//! e.g. a constraint reused across an unrelated prompt) falls back to a full
//! replay from the start.
//!
//! Known gaps: numbers accept any digit/`.`/`e`/`E`/`+`/`-` run rather than
//! strict JSON number syntax (no leading-zero rejection, no digit-after-`.`
//! requirement), and an object accepts a trailing comma before `}`. Both are
//! over-approximations; a generated string conforming to this grammar is not
//! guaranteed to be strictly valid JSON, but nothing this grammar accepts as
//! *complete* can be structurally broken (unbalanced braces, missing colons).

use super::{Constraint, ConstraintStep};
use crate::tokenizer::Vocab;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    ExpectValue,
    AfterValue,
    InObjectExpectKeyOrClose,
    InObjectExpectColon,
    InObjectExpectValue,
    InObjectAfterValue,
    InArrayExpectValueOrClose,
    InArrayAfterValue,
    InString,
    InStringEscape,
    InNumber,
    InLiteral(&'static str, usize),
}

#[derive(Debug, Clone)]
struct GrammarState {
    stack: Vec<Frame>,
    mode: Mode,
    after_value: Mode,
    string_is_key: bool,
}

impl GrammarState {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            mode: Mode::ExpectValue,
            after_value: Mode::AfterValue,
            string_is_key: false,
        }
    }

    fn at_top_level_done(&self) -> bool {
        self.stack.is_empty() && self.mode == Mode::AfterValue
    }

    fn close_string(&mut self) {
        if self.string_is_key {
            self.string_is_key = false;
            self.mode = Mode::InObjectExpectColon;
        } else {
            self.mode = self.after_value.clone();
        }
    }

    fn end_value(&mut self) {
        self.mode = self.after_value.clone();
    }

    fn begin_value(&mut self, c: char) -> bool {
        match c {
            '{' => {
                self.stack.push(Frame::Object);
                self.mode = Mode::InObjectExpectKeyOrClose;
                true
            }
            '[' => {
                self.stack.push(Frame::Array);
                self.mode = Mode::InArrayExpectValueOrClose;
                true
            }
            '"' => {
                self.string_is_key = false;
                self.mode = Mode::InString;
                true
            }
            '-' | '0'..='9' => {
                self.mode = Mode::InNumber;
                true
            }
            't' => {
                self.mode = Mode::InLiteral("true", 1);
                true
            }
            'f' => {
                self.mode = Mode::InLiteral("false", 1);
                true
            }
            'n' => {
                self.mode = Mode::InLiteral("null", 1);
                true
            }
            _ => false,
        }
    }

    fn pop_container(&mut self) {
        self.stack.pop();
        self.mode = match self.stack.last() {
            None => Mode::AfterValue,
            Some(Frame::Object) => Mode::InObjectAfterValue,
            Some(Frame::Array) => Mode::InArrayAfterValue,
        };
    }

    fn step_structural(&mut self, c: char) -> bool {
        match self.mode.clone() {
            Mode::ExpectValue => {
                self.after_value = Mode::AfterValue;
                self.begin_value(c)
            }
            Mode::AfterValue => false,
            Mode::InObjectExpectKeyOrClose => {
                if c == '}' {
                    self.pop_container();
                    true
                } else if c == '"' {
                    self.string_is_key = true;
                    self.mode = Mode::InString;
                    true
                } else {
                    false
                }
            }
            Mode::InObjectExpectColon => {
                if c == ':' {
                    self.mode = Mode::InObjectExpectValue;
                    true
                } else {
                    false
                }
            }
            Mode::InObjectExpectValue => {
                self.after_value = Mode::InObjectAfterValue;
                self.begin_value(c)
            }
            Mode::InObjectAfterValue => {
                if c == ',' {
                    self.mode = Mode::InObjectExpectKeyOrClose;
                    true
                } else if c == '}' {
                    self.pop_container();
                    true
                } else {
                    false
                }
            }
            Mode::InArrayExpectValueOrClose => {
                if c == ']' {
                    self.pop_container();
                    true
                } else {
                    self.after_value = Mode::InArrayAfterValue;
                    self.begin_value(c)
                }
            }
            Mode::InArrayAfterValue => {
                if c == ',' {
                    self.mode = Mode::InArrayExpectValueOrClose;
                    true
                } else if c == ']' {
                    self.pop_container();
                    true
                } else {
                    false
                }
            }
            Mode::InString | Mode::InStringEscape | Mode::InNumber | Mode::InLiteral(_, _) => {
                unreachable!("handled before step_structural")
            }
        }
    }

    /// Consume one character, returning `false` if it is never legal here.
    fn step(&mut self, c: char) -> bool {
        match self.mode {
            Mode::InString => {
                return if c == '\\' {
                    self.mode = Mode::InStringEscape;
                    true
                } else if c == '"' {
                    self.close_string();
                    true
                } else {
                    true
                };
            }
            Mode::InStringEscape => {
                self.mode = Mode::InString;
                return true;
            }
            _ => {}
        }
        if c.is_whitespace() {
            if let Mode::InNumber = self.mode {
                self.end_value();
            }
            return true;
        }
        match self.mode.clone() {
            Mode::InNumber => {
                if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-') {
                    true
                } else {
                    self.end_value();
                    self.step(c)
                }
            }
            Mode::InLiteral(lit, pos) => {
                let expected = lit.as_bytes()[pos] as char;
                if c != expected {
                    return false;
                }
                if pos + 1 == lit.len() {
                    self.end_value();
                } else {
                    self.mode = Mode::InLiteral(lit, pos + 1);
                }
                true
            }
            _ => self.step_structural(c),
        }
    }
}

fn replay(text: &str) -> Option<GrammarState> {
    let mut state = GrammarState::new();
    for c in text.chars() {
        if !state.step(c) {
            return None;
        }
    }
    Some(state)
}

/// A constraint that only accepts generations forming a JSON value.
pub struct GrammarConstraint {
    /// The text whose acceptance produced `cached_state`, so the next call
    /// can detect whether it merely extends this call's text.
    cached_text: String,
    /// The PDA state after `cached_text`, or `None` if `cached_text` is
    /// already infeasible.
    cached_state: Option<GrammarState>,
}

impl GrammarConstraint {
    /// Build a constraint over the JSON value grammar.
    pub fn json() -> Self {
        Self {
            cached_text: String::new(),
            cached_state: Some(GrammarState::new()),
        }
    }

    /// State after `generated_so_far`, replaying only the suffix past
    /// `cached_text` when `generated_so_far` extends it.
    fn advance(&mut self, generated_so_far: &str) -> Option<GrammarState> {
        let state = if let (true, Some(state)) = (
            generated_so_far.starts_with(self.cached_text.as_str()),
            &self.cached_state,
        ) {
            let mut state = state.clone();
            let suffix = &generated_so_far[self.cached_text.len()..];
            let mut ok = true;
            for c in suffix.chars() {
                if !state.step(c) {
                    ok = false;
                    break;
                }
            }
            self.cached_text.push_str(suffix);
            if ok {
                Some(state)
            } else {
                None
            }
        } else {
            self.cached_text.clear();
            self.cached_text.push_str(generated_so_far);
            replay(generated_so_far)
        };
        self.cached_state = state.clone();
        state
    }
}

impl Default for GrammarConstraint {
    fn default() -> Self {
        Self::json()
    }
}

impl Constraint for GrammarConstraint {
    fn step(&mut self, generated_so_far: &str, vocab: &Vocab) -> ConstraintStep {
        let Some(base) = self.advance(generated_so_far) else {
            return ConstraintStep {
                mask: vec![false; vocab.len()],
                complete: false,
            };
        };
        let mut mask = vec![false; vocab.len()];
        for id in 0..vocab.len() as u32 {
            let Some(token_text) = vocab.token(id) else {
                continue;
            };
            let mut candidate = base.clone();
            let mut ok = true;
            for c in token_text.chars() {
                if !candidate.step(c) {
                    ok = false;
                    break;
                }
            }
            mask[id as usize] = ok;
        }
        ConstraintStep {
            mask,
            complete: base.at_top_level_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocab {
        Vocab::new(
            vec!["{", "}", "\"", "a", ":", "1", ","]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }

    #[test]
    fn open_brace_is_the_only_feasible_start() {
        let mut c = GrammarConstraint::json();
        let step = c.step("", &vocab());
        assert!(step.mask[0]); // "{"
        assert!(!step.mask[1]); // "}"
        assert!(!step.complete);
    }

    #[test]
    fn quote_starts_a_key_after_open_brace() {
        let mut c = GrammarConstraint::json();
        let step = c.step("{", &vocab());
        assert!(step.mask[2]); // '"'
        assert!(!step.mask[5]); // "1" cannot start a key
    }

    #[test]
    fn full_object_is_complete() {
        let mut c = GrammarConstraint::json();
        let step = c.step("{\"a\":1}", &vocab());
        assert!(step.complete);
    }

    #[test]
    fn truncated_object_is_not_complete() {
        let mut c = GrammarConstraint::json();
        let step = c.step("{\"a\":1", &vocab());
        assert!(!step.complete);
        assert!(step.mask[1]); // "}" closes it
        assert!(step.mask[6]); // "," continues it
    }
}
