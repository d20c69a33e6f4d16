//! Subject syntax and the subject matcher (sublist).
//!
//! Subjects are dotted token strings (`flow.f1.stage.s1.port.out`).
//! Patterns extend subjects with two wildcards: `*` matches exactly one
//! token, `>` matches one or more trailing tokens and may appear only as
//! the final token. The [`Sublist`] maps a literal publish subject to the
//! set of subscriptions whose pattern accepts it.

mod sublist;


use std::fmt;

pub use sublist::{MatchResult, Sublist, SublistStats, SUBLIST_CACHE_MAX};

/// Token delimiter in subjects and patterns.
pub const DELIMITER: char = '.';

/// The single-token wildcard.
pub const WILDCARD_ANY: &str = "*";

/// The terminal tail wildcard, matching one or more trailing tokens.
pub const WILDCARD_TAIL: &str = ">";

/// Errors from subject parsing and sublist operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    /// The subject or pattern string is empty.
    #[error("empty subject")]
    Empty,

    /// A token between delimiters is empty (`a..b`, leading or trailing `.`).
    #[error("empty token in subject: {0:?}")]
    EmptyToken(String),

    /// A token contains a disallowed character (whitespace), or a literal
    /// publish subject contains a wildcard token.
    #[error("invalid token {token:?} in subject {subject:?}")]
    InvalidToken {
        /// The offending token.
        token: String,
        /// The full subject string.
        subject: String,
    },

    /// The tail wildcard `>` appeared in a non-terminal position.
    #[error("tail wildcard must be the final token: {0:?}")]
    TailNotLast(String),

    /// Removal did not find the subscription. Idempotent cancellation
    /// swallows this outcome.
    #[error("subscription not found")]
    SubscriptionNotFound,
}

/// Unique identifier for a subscription within one sublist.
///
/// Monotonically assigned by [`crate::pubsub::PubSub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Returns `true` if `token` is usable as a single literal subject token:
/// non-empty, no delimiter, no whitespace, not a wildcard.
///
/// Flow and stage identifiers must satisfy this so they can be embedded in
/// intra-flow subjects.
#[must_use]
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token != WILDCARD_ANY
        && token != WILDCARD_TAIL
        && !token.chars().any(|c| c == DELIMITER || c.is_whitespace())
}

/// A single pattern token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A literal token, matched by string equality.
    Literal(String),
    /// `*` — matches exactly one token.
    Any,
    /// `>` — matches one or more trailing tokens; terminal only.
    Tail,
}

/// A validated, literal (wildcard-free) publish subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    raw: String,
    tokens: Vec<String>,
}

impl Subject {
    /// Parses a literal subject.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if the subject is empty, contains an empty
    /// or whitespace token, or contains a wildcard token (publish subjects
    /// are literal).
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        let tokens = split_tokens(raw)?;
        for token in &tokens {
            if !is_valid_token(token) {
                return Err(SubjectError::InvalidToken {
                    token: token.clone(),
                    subject: raw.to_string(),
                });
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// The subject as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed tokens.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

impl Pattern {
    /// Parses a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if the pattern is empty, contains an empty
    /// or whitespace token, or places `>` anywhere but last.
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        let split = split_tokens(raw)?;
        let last = split.len() - 1;
        let mut tokens = Vec::with_capacity(split.len());
        for (i, token) in split.into_iter().enumerate() {
            let parsed = match token.as_str() {
                WILDCARD_ANY => Token::Any,
                WILDCARD_TAIL => {
                    if i != last {
                        return Err(SubjectError::TailNotLast(raw.to_string()));
                    }
                    Token::Tail
                }
                _ => {
                    if token.chars().any(char::is_whitespace) {
                        return Err(SubjectError::InvalidToken {
                            token,
                            subject: raw.to_string(),
                        });
                    }
                    Token::Literal(token)
                }
            };
            tokens.push(parsed);
        }
        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// The pattern as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed tokens.
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Returns `true` if the pattern contains a wildcard token.
    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Any | Token::Tail))
    }

    /// Returns `true` if this pattern accepts the given literal token
    /// sequence under the wildcard rules.
    #[must_use]
    pub fn matches_tokens(&self, subject: &[String]) -> bool {
        let mut i = 0;
        for token in &self.tokens {
            match token {
                Token::Tail => return i < subject.len(),
                Token::Any => {
                    if i >= subject.len() {
                        return false;
                    }
                    i += 1;
                }
                Token::Literal(lit) => {
                    if subject.get(i).map(String::as_str) != Some(lit.as_str()) {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == subject.len()
    }

    /// Returns `true` if this pattern accepts the given literal subject.
    #[must_use]
    pub fn matches(&self, subject: &Subject) -> bool {
        self.matches_tokens(subject.tokens())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Splits a raw subject into tokens, rejecting empties.
fn split_tokens(raw: &str) -> Result<Vec<String>, SubjectError> {
    if raw.is_empty() {
        return Err(SubjectError::Empty);
    }
    let tokens: Vec<String> = raw.split(DELIMITER).map(str::to_string).collect();
    if tokens.iter().any(String::is_empty) {
        return Err(SubjectError::EmptyToken(raw.to_string()));
    }
    Ok(tokens)
}
