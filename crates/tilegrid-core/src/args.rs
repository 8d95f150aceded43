//! Task argument grammar.
//!
//! A task definition's command line is a whitespace-separated stream of
//! words. A word wrapped in `{...}` is a [`ArgumentKind::Parameter`] whose
//! name is the text between the braces; every other word is passed through
//! to the invoked script as an [`ArgumentKind::Literal`].
//!
//! A backslash immediately before a space escapes it: the space stays inside
//! the current word and only the backslash is dropped. This holds for
//! literal and parameter words alike, so both `hello\ world` and
//! `-R[select=broadwell\ core(1)]` survive as single tokens.
//!
//! Tokenizing is independent of substitution; parameter values are resolved
//! at dispatch time by the scheduler.

use serde::{Deserialize, Serialize};

/// Whether a token is passed verbatim or substituted at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentKind {
    Literal,
    Parameter,
}

/// One token of a task's argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentToken {
    pub kind: ArgumentKind,
    pub value: String,
}

impl ArgumentToken {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            kind: ArgumentKind::Literal,
            value: value.into(),
        }
    }

    pub fn parameter(value: impl Into<String>) -> Self {
        Self {
            kind: ArgumentKind::Parameter,
            value: value.into(),
        }
    }

    pub fn is_parameter(&self) -> bool {
        self.kind == ArgumentKind::Parameter
    }
}

/// Split a command line into literal and parameter tokens.
pub fn tokenize(input: &str) -> Vec<ArgumentToken> {
    split_words(input).into_iter().map(classify).collect()
}

/// Split on unescaped whitespace, folding `\ ` into a literal space.
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&' ') {
            chars.next();
            current.push(' ');
        } else if c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}

fn classify(word: String) -> ArgumentToken {
    // `{}` carries no name; keep it literal rather than emit an empty argument.
    if word.len() > 2 && word.starts_with('{') && word.ends_with('}') {
        ArgumentToken::parameter(&word[1..word.len() - 1])
    } else {
        ArgumentToken::literal(word)
    }
}
