//! XOR-group completion tokens.
//!
//! A completion token is a 64-bit value under XOR; the group identity is
//! zero. Splitting a value into `n` tokens and merging them back yields
//! the original value, which lets a gather stage detect "all parts of a
//! dynamically-sized derivation accounted for" without counting: it
//! accumulates values per token id and treats a zero result as complete.
//!
//! For an unbounded fan-out, the scatter side mixes in an extra "starter"
//! token and settles it with a final completion message, driving the
//! accumulated value to zero only once the tail is known.

use std::fmt;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

/// A 64-bit XOR-group element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenValue(u64);

impl TokenValue {
    /// The group identity: merging with zero is a no-op.
    pub const ZERO: Self = Self(0);

    /// A uniformly random token value.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Merges two values. Associative and commutative.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self(self.0 ^ other.0)
    }

    /// Splits this value into `count` tokens whose merge equals `self`:
    /// `count - 1` fresh randoms plus one derived remainder.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn split(self, count: usize) -> SmallVec<[Self; 4]> {
        assert!(count > 0, "token must split into at least one value");
        let mut values = SmallVec::with_capacity(count);
        let mut remainder = self;
        for _ in 0..count - 1 {
            let fresh = Self::random();
            remainder = remainder.merge(fresh);
            values.push(fresh);
        }
        // Merging the randoms back into the remainder cancels them out,
        // leaving the original value.
        values.push(remainder);
        values
    }

    /// Returns `true` for the group identity.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of a token group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Mints a fresh token-group identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mapping from token id to accumulated token value, carried on
/// messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenBag(FxHashMap<TokenId, TokenValue>);

impl TokenBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` under `id`, replacing any previous value.
    pub fn insert(&mut self, id: TokenId, value: TokenValue) {
        self.0.insert(id, value);
    }

    /// The value recorded under `id`, if any.
    #[must_use]
    pub fn get(&self, id: &TokenId) -> Option<TokenValue> {
        self.0.get(id).copied()
    }

    /// Returns a new bag whose key set is the union of both bags and whose
    /// values are the XOR of matching entries; an entry missing on either
    /// side is treated as zero.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (id, value) in &other.0 {
            let entry = merged.entry(id.clone()).or_insert(TokenValue::ZERO);
            *entry = entry.merge(*value);
        }
        Self(merged)
    }

    /// Number of token ids in the bag.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the bag holds no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(id, value)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&TokenId, TokenValue)> {
        self.0.iter().map(|(id, value)| (id, *value))
    }
}

impl FromIterator<(TokenId, TokenValue)> for TokenBag {
    fn from_iter<I: IntoIterator<Item = (TokenId, TokenValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
