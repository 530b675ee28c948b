//! Multicast handler registry.
//!
//! Each notification kind a component exposes (weight received, link lost,
//! button pressed, ...) owns one [`HandlerRegistry`].  Handlers are async
//! closures; dispatch takes a snapshot of the list first, so handlers may be
//! added or removed from inside another handler without deadlocking and
//! without affecting the dispatch already in progress.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;

/// Handle returned by [`HandlerRegistry::subscribe`]; pass it back to
/// [`HandlerRegistry::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// Process-wide so ids never collide between registries.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct HandlerRegistry<T> {
    name: &'static str,
    handlers: RwLock<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> HandlerRegistry<T>
where
    T: Clone + Send + 'static,
{
    /// `name` only appears in log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let boxed: Handler<T> = Arc::new(move |value| Box::pin(handler(value)));
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, boxed));
        id
    }

    /// Remove a handler. Returns `false` if `id` was not registered here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler in subscription order, each bounded by `budget`.
    ///
    /// A handler that overruns is abandoned and logged.  Returns the number
    /// of handlers that finished within budget.
    pub async fn dispatch(&self, value: T, budget: Duration) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let mut completed = 0;
        for handler in snapshot {
            match tokio::time::timeout(budget, handler(value.clone())).await {
                Ok(()) => completed += 1,
                Err(_) => warn!(
                    notification = self.name,
                    budget_ms = budget.as_millis() as u64,
                    "handler exceeded its time budget and was abandoned"
                ),
            }
        }
        completed
    }
}

impl<T> std::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or_default();
        f.debug_struct("HandlerRegistry")
            .field("name", &self.name)
            .field("handlers", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const BUDGET: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn every_subscriber_receives_the_value() {
        let registry: HandlerRegistry<f64> = HandlerRegistry::new("weight");
        let sum = Arc::new(Mutex::new(0.0));
        for _ in 0..3 {
            let sum = Arc::clone(&sum);
            registry.subscribe(move |w| {
                let sum = Arc::clone(&sum);
                async move {
                    *sum.lock().unwrap() += w;
                }
            });
        }
        assert_eq!(registry.dispatch(2.5, BUDGET).await, 3);
        assert!((*sum.lock().unwrap() - 7.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_handler() {
        let registry: HandlerRegistry<()> = HandlerRegistry::new("button");
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        let first = registry.subscribe(move |()| {
            let h1 = Arc::clone(&h1);
            async move {
                h1.fetch_add(1, Ordering::SeqCst);
            }
        });
        let h2 = Arc::clone(&hits);
        registry.subscribe(move |()| {
            let h2 = Arc::clone(&h2);
            async move {
                h2.fetch_add(10, Ordering::SeqCst);
            }
        });

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        registry.dispatch((), BUDGET).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn handler_may_subscribe_during_dispatch() {
        let registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new("nested"));
        let inner = Arc::clone(&registry);
        registry.subscribe(move |()| {
            let inner = Arc::clone(&inner);
            async move {
                inner.subscribe(|()| async {});
            }
        });
        // The snapshot taken before the call only holds the first handler.
        assert_eq!(registry.dispatch((), BUDGET).await, 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_abandoned_after_budget() {
        let registry: HandlerRegistry<()> = HandlerRegistry::new("slow");
        registry.subscribe(|()| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        registry.subscribe(|()| async {});

        let started = tokio::time::Instant::now();
        assert_eq!(registry.dispatch((), BUDGET).await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
