//! Trie-based subject matcher with a bounded match-result cache.
//!
//! The sublist is the one shared mutable structure in the runtime: every
//! publish consults it and every subscribe/cancel mutates it, so all
//! operations are safe for concurrent use. Insert, remove, and match walk
//! one trie level per subject token — O(depth × fanout) — and cache hits
//! are O(1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::{Pattern, Subject, SubjectError, SubscriptionId, Token};

/// Maximum number of literal subjects kept in the match-result cache.
pub const SUBLIST_CACHE_MAX: usize = 1024;

/// The set of subscriptions matching one literal subject, partitioned into
/// plain and queue-group subscribers.
///
/// Queue groups are not routed by this runtime; the partition is exposed so
/// callers can observe (and reject) them.
#[derive(Debug)]
pub struct MatchResult<T> {
    /// Plain subscriptions, in deterministic matcher order.
    pub plain: SmallVec<[T; 4]>,
    /// Queue-group subscriptions, paired with their group name.
    pub queue: SmallVec<[(String, T); 2]>,
}

impl<T> MatchResult<T> {
    fn empty() -> Self {
        Self {
            plain: SmallVec::new(),
            queue: SmallVec::new(),
        }
    }

    /// Total number of matched subscriptions across both partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plain.len() + self.queue.len()
    }

    /// Returns `true` if no subscription matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.queue.is_empty()
    }
}

/// One inserted subscription.
struct Entry<T> {
    id: SubscriptionId,
    queue: Option<String>,
    payload: T,
}

/// A node holds the subscriptions whose pattern terminates here and the
/// next trie level for longer patterns.
struct Node<T> {
    subs: Vec<Entry<T>>,
    next: Option<Level<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            subs: Vec::new(),
            next: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.next.as_ref().map_or(true, Level::is_empty)
    }
}

/// One trie level: literal children plus the two wildcard children.
struct Level<T> {
    nodes: FxHashMap<String, Node<T>>,
    any: Option<Box<Node<T>>>,
    tail: Option<Box<Node<T>>>,
}

impl<T> Level<T> {
    fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            any: None,
            tail: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.any.is_none() && self.tail.is_none()
    }

    fn child_mut(&mut self, token: &Token) -> &mut Node<T> {
        match token {
            Token::Literal(lit) => self
                .nodes
                .entry(lit.clone())
                .or_insert_with(Node::new),
            Token::Any => self.any.get_or_insert_with(|| Box::new(Node::new())),
            Token::Tail => self.tail.get_or_insert_with(|| Box::new(Node::new())),
        }
    }

    fn existing_child_mut(&mut self, token: &Token) -> Option<&mut Node<T>> {
        match token {
            Token::Literal(lit) => self.nodes.get_mut(lit.as_str()),
            Token::Any => self.any.as_deref_mut(),
            Token::Tail => self.tail.as_deref_mut(),
        }
    }

    fn prune(&mut self, token: &Token) {
        match token {
            Token::Literal(lit) => {
                if self.nodes.get(lit.as_str()).is_some_and(Node::is_empty) {
                    self.nodes.remove(lit.as_str());
                }
            }
            Token::Any => {
                if self.any.as_deref().is_some_and(Node::is_empty) {
                    self.any = None;
                }
            }
            Token::Tail => {
                if self.tail.as_deref().is_some_and(Node::is_empty) {
                    self.tail = None;
                }
            }
        }
    }
}

/// Internal counters, read without locking.
struct StatsInner {
    inserts: AtomicU64,
    removes: AtomicU64,
    matches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }
}

/// A point-in-time snapshot of sublist counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SublistStats {
    /// Subscriptions inserted since creation.
    pub inserts: u64,
    /// Subscriptions removed since creation.
    pub removes: u64,
    /// Match operations performed.
    pub matches: u64,
    /// Matches served from the cache.
    pub cache_hits: u64,
    /// Matches that had to walk the trie.
    pub cache_misses: u64,
}

struct Inner<T> {
    root: Level<T>,
    cache: FxHashMap<String, Arc<MatchResult<T>>>,
    subscription_count: usize,
}

/// Tokenised trie mapping literal publish subjects to subscriptions.
///
/// Generic over the subscriber payload `T`, which is cloned into match
/// results ([`crate::pubsub::PubSub`] stores `Arc`ed subscribers).
pub struct Sublist<T> {
    inner: RwLock<Inner<T>>,
    stats: StatsInner,
}

impl<T: Clone> Default for Sublist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Sublist<T> {
    /// Creates an empty sublist with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                root: Level::new(),
                cache: FxHashMap::default(),
                subscription_count: 0,
            }),
            stats: StatsInner::new(),
        }
    }

    /// Inserts a subscription under `pattern`.
    ///
    /// Evicts every cached subject the new pattern matches, so no cached
    /// result can omit the new subscription.
    pub fn insert(
        &self,
        id: SubscriptionId,
        pattern: &Pattern,
        queue: Option<String>,
        payload: T,
    ) {
        let mut inner = self.inner.write();
        insert_at(&mut inner.root, pattern.tokens(), Entry { id, queue, payload });
        inner.subscription_count += 1;
        invalidate(&mut inner.cache, pattern);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the subscription `id` previously inserted under `pattern`,
    /// pruning now-empty trie nodes.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError::SubscriptionNotFound`] if no such
    /// subscription exists; idempotent cancellation swallows this.
    pub fn remove(&self, id: SubscriptionId, pattern: &Pattern) -> Result<(), SubjectError> {
        let mut inner = self.inner.write();
        remove_at(&mut inner.root, pattern.tokens(), id)?;
        inner.subscription_count -= 1;
        invalidate(&mut inner.cache, pattern);
        self.stats.removes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns all subscriptions whose pattern accepts `subject`.
    ///
    /// Results are cached per literal subject; insert/remove invalidate
    /// affected entries, so a cached result is never stale at return time.
    pub fn match_subject(&self, subject: &Subject) -> Arc<MatchResult<T>> {
        self.stats.matches.fetch_add(1, Ordering::Relaxed);
        {
            let inner = self.inner.read();
            if let Some(result) = inner.cache.get(subject.as_str()) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(result);
            }
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Recompute under the write lock so the inserted cache entry cannot
        // race with a concurrent insert/remove and go stale.
        let mut inner = self.inner.write();
        if let Some(result) = inner.cache.get(subject.as_str()) {
            return Arc::clone(result);
        }
        let mut result = MatchResult::empty();
        collect_matches(&inner.root, subject.tokens(), &mut result);
        let result = Arc::new(result);
        if inner.cache.len() >= SUBLIST_CACHE_MAX {
            if let Some(evict) = inner.cache.keys().next().cloned() {
                inner.cache.remove(&evict);
            }
        }
        inner
            .cache
            .insert(subject.as_str().to_string(), Arc::clone(&result));
        result
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.read().subscription_count
    }

    /// Number of cached literal subjects.
    #[must_use]
    pub fn cached_subjects(&self) -> usize {
        self.inner.read().cache.len()
    }

    /// Snapshot of operation counters.
    #[must_use]
    pub fn stats(&self) -> SublistStats {
        SublistStats {
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            removes: self.stats.removes.load(Ordering::Relaxed),
            matches: self.stats.matches.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Evicts every cached subject the changed pattern matches.
fn invalidate<T>(cache: &mut FxHashMap<String, Arc<MatchResult<T>>>, pattern: &Pattern) {
    cache.retain(|subject, _| {
        let tokens: Vec<String> = subject.split(super::DELIMITER).map(str::to_string).collect();
        !pattern.matches_tokens(&tokens)
    });
}

/// Gathers matching subscriptions for `tokens`, depth first.
///
/// Order is deterministic: at each level, tail-wildcard subscriptions,
/// then single-token-wildcard branches, then the literal branch; within a
/// node, insertion order.
fn collect_matches<T: Clone>(level: &Level<T>, tokens: &[String], out: &mut MatchResult<T>) {
    let Some((first, rest)) = tokens.split_first() else {
        return;
    };
    if let Some(node) = level.tail.as_deref() {
        // `>` absorbs the (non-empty) remainder.
        push_subs(node, out);
    }
    if let Some(node) = level.any.as_deref() {
        if rest.is_empty() {
            push_subs(node, out);
        } else if let Some(next) = &node.next {
            collect_matches(next, rest, out);
        }
    }
    if let Some(node) = level.nodes.get(first.as_str()) {
        if rest.is_empty() {
            push_subs(node, out);
        } else if let Some(next) = &node.next {
            collect_matches(next, rest, out);
        }
    }
}

fn push_subs<T: Clone>(node: &Node<T>, out: &mut MatchResult<T>) {
    for entry in &node.subs {
        match &entry.queue {
            None => out.plain.push(entry.payload.clone()),
            Some(group) => out.queue.push((group.clone(), entry.payload.clone())),
        }
    }
}

/// Inserts `entry` at the node the pattern path terminates on, creating
/// levels on demand.
fn insert_at<T>(level: &mut Level<T>, tokens: &[Token], entry: Entry<T>) {
    // Patterns are validated non-empty, so the path always terminates.
    let Some((first, rest)) = tokens.split_first() else {
        return;
    };
    let node = level.child_mut(first);
    if rest.is_empty() {
        node.subs.push(entry);
    } else {
        insert_at(node.next.get_or_insert_with(Level::new), rest, entry);
    }
}

/// Removes subscription `id` along the pattern path, pruning empty nodes
/// on the way back up.
fn remove_at<T>(
    level: &mut Level<T>,
    tokens: &[Token],
    id: SubscriptionId,
) -> Result<(), SubjectError> {
    let Some((first, rest)) = tokens.split_first() else {
        return Err(SubjectError::SubscriptionNotFound);
    };
    let Some(node) = level.existing_child_mut(first) else {
        return Err(SubjectError::SubscriptionNotFound);
    };
    if rest.is_empty() {
        let before = node.subs.len();
        node.subs.retain(|entry| entry.id != id);
        if node.subs.len() == before {
            return Err(SubjectError::SubscriptionNotFound);
        }
    } else {
        let Some(next) = node.next.as_mut() else {
            return Err(SubjectError::SubscriptionNotFound);
        };
        remove_at(next, rest, id)?;
        if next.is_empty() {
            node.next = None;
        }
    }
    level.prune(first);
    Ok(())
}
