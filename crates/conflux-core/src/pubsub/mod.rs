//! Publish/subscribe bus over the subject matcher.
//!
//! Delivery is **synchronous fan-out**: `publish` awaits every matched
//! handler on the publisher's task before returning, so a slow subscriber
//! backs pressure up to the publisher — this is the designed backpressure
//! path. Delivery order within one publish follows the matcher's
//! deterministic iteration order; across subjects there is no ordering
//! guarantee.
//!
//! Each pub/sub instance owns its own [`Sublist`]; there are no
//! process-wide singletons. Construct one explicitly and hand it to every
//! flow that should share a routing domain.

use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::msg::Message;
use crate::subject::{MatchResult, Pattern, Subject, SubjectError, Sublist, SublistStats, SubscriptionId};

#[cfg(test)]
mod tests;

/// Boxed future returned by subscription handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The match result delivered to debug subscribers.
pub type MatchedSubscribers = Arc<MatchResult<Arc<Subscriber>>>;

/// A plain subscription handler, invoked on the publisher's task.
pub trait Handler: Send + Sync + 'static {
    /// Handles one delivered message.
    fn handle(&self, subject: String, msg: Message) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, subject: String, msg: Message) -> HandlerFuture {
        Box::pin(self(subject, msg))
    }
}

/// A debug subscription handler: additionally receives the full match
/// result for the publish that delivered the message, for tracing.
pub trait DebugHandler: Send + Sync + 'static {
    /// Handles one delivered message plus the publish's match result.
    fn handle(&self, subject: String, msg: Message, matches: MatchedSubscribers) -> HandlerFuture;
}

impl<F, Fut> DebugHandler for F
where
    F: Fn(String, Message, MatchedSubscribers) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, subject: String, msg: Message, matches: MatchedSubscribers) -> HandlerFuture {
        Box::pin(self(subject, msg, matches))
    }
}

enum HandlerKind {
    Plain(Box<dyn Handler>),
    Debug(Box<dyn DebugHandler>),
}

/// A registered subscription: pattern, identity, and handler, plus the
/// source location that created it.
pub struct Subscriber {
    id: SubscriptionId,
    pattern: Pattern,
    location: &'static Location<'static>,
    handler: HandlerKind,
}

impl Subscriber {
    /// The subscription's unique id within its bus.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The pattern this subscription listens on.
    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Source location of the subscribing call, for observability.
    #[must_use]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Returns `true` for debug subscriptions.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        matches!(self.handler, HandlerKind::Debug(_))
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("location", &format_args!("{}", self.location))
            .field("debug", &self.is_debug())
            .finish()
    }
}

/// Cancels its subscription when dropped; explicit [`cancel`](Self::cancel)
/// is idempotent.
#[must_use = "dropping the guard cancels the subscription"]
pub struct SubscriptionGuard {
    sublist: Arc<Sublist<Arc<Subscriber>>>,
    pattern: Pattern,
    id: SubscriptionId,
    cancelled: AtomicBool,
}

impl SubscriptionGuard {
    /// Cancels the subscription. Safe to call any number of times;
    /// cancelling an already-cancelled subscription is a no-op.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            // Not-found is swallowed: the subscription may already be gone.
            let _ = self.sublist.remove(self.id, &self.pattern);
        }
    }

    /// The subscription id this guard controls.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Subject-based publish/subscribe bus.
pub struct PubSub {
    sublist: Arc<Sublist<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    /// Creates a bus with an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sublist: Arc::new(Sublist::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribes `handler` to `subject`.
    ///
    /// The handler runs synchronously on the publishing task. The returned
    /// guard cancels the subscription on drop; cancellation is idempotent.
    ///
    /// The caller's source location is recorded on the subscription.
    /// Wrappers that subscribe on behalf of their own callers should be
    /// `#[track_caller]` so the location reported is theirs.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if `subject` is not a valid pattern.
    #[track_caller]
    pub fn subscribe(
        &self,
        subject: &str,
        handler: impl Handler,
    ) -> Result<SubscriptionGuard, SubjectError> {
        self.install(subject, HandlerKind::Plain(Box::new(handler)), Location::caller())
    }

    /// Subscribes a debug handler to `subject`; it additionally receives
    /// the full match result of each publish that reaches it.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if `subject` is not a valid pattern.
    #[track_caller]
    pub fn subscribe_debug(
        &self,
        subject: &str,
        handler: impl DebugHandler,
    ) -> Result<SubscriptionGuard, SubjectError> {
        self.install(subject, HandlerKind::Debug(Box::new(handler)), Location::caller())
    }

    /// Subscribes to `subject` and forwards each delivered message onto a
    /// bounded channel of the given capacity.
    ///
    /// When `token` is cancelled, the subscription is cancelled and the
    /// channel closes; the caller must not close the channel itself. Once
    /// the channel is full, delivery blocks the publisher unless
    /// cancellation wins the race, in which case the message is dropped
    /// for this subscriber only.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if `subject` is not a valid pattern.
    #[track_caller]
    pub fn subscribe_channel(
        &self,
        subject: &str,
        capacity: usize,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<Message>, SubjectError> {
        let (tx, rx) = mpsc::channel(capacity);
        let forward_token = token.clone();
        let guard = self.subscribe(subject, move |_subject: String, msg: Message| {
            let tx = tx.clone();
            let token = forward_token.clone();
            async move {
                tokio::select! {
                    result = tx.send(msg) => {
                        if result.is_err() {
                            tracing::debug!("channel subscriber gone; dropping message");
                        }
                    }
                    () = token.cancelled() => {}
                }
            }
        })?;
        tokio::spawn(async move {
            token.cancelled().await;
            guard.cancel();
        });
        Ok(rx)
    }

    /// Publishes `msg` on `subject`, invoking every matched handler on the
    /// current task before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if `subject` is not a valid literal
    /// subject (publish subjects admit no wildcards).
    pub async fn publish(&self, subject: &str, msg: Message) -> Result<(), SubjectError> {
        let parsed = Subject::parse(subject)?;
        let matches = self.sublist.match_subject(&parsed);
        // Queue groups are matched but not routed.
        debug_assert!(
            matches.queue.is_empty(),
            "queue-group subscriptions are not supported"
        );
        for sub in &matches.plain {
            match &sub.handler {
                HandlerKind::Plain(handler) => {
                    handler.handle(subject.to_string(), msg.clone()).await;
                }
                HandlerKind::Debug(handler) => {
                    handler
                        .handle(subject.to_string(), msg.clone(), Arc::clone(&matches))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.sublist.subscription_count()
    }

    /// Snapshot of the underlying matcher's counters.
    #[must_use]
    pub fn stats(&self) -> SublistStats {
        self.sublist.stats()
    }

    fn install(
        &self,
        subject: &str,
        handler: HandlerKind,
        location: &'static Location<'static>,
    ) -> Result<SubscriptionGuard, SubjectError> {
        let pattern = Pattern::parse(subject)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            pattern: pattern.clone(),
            location,
            handler,
        });
        self.sublist.insert(id, &pattern, None, subscriber);
        Ok(SubscriptionGuard {
            sublist: Arc::clone(&self.sublist),
            pattern,
            id,
            cancelled: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
