//! # Bounded concurrency executor.
//!
//! Fans a stage's per-resource calls out over a [`JoinSet`], gated by a
//! [`Semaphore`], and fans back in once every dispatched call has finished.
//!
//! ```text
//! items ──► acquire permit ──► spawn(op(item)) ──┐   (≤ limit in flight)
//!   ▲            │                               │
//!   │     [cancelled: stop dispatching]          ▼
//!   └──────── next item                  join_next() barrier
//!                                                │
//!                     Done ─► kept   Skipped ─► ItemSkipped   Err/panic ─► ItemFailed
//! ```
//!
//! ## Rules
//! - A permit is acquired **before** dispatch and released when the call ends,
//!   whatever its outcome.
//! - The caller always waits for every dispatched call.
//! - Failures and panics exclude the item; they are reported, never propagated.
//! - Once the attempt token is cancelled no further item is dispatched; calls
//!   already running complete and their results are kept.
//! - Output order is completion order.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::{select, sync::Semaphore, task::JoinSet};

use crate::events::{Event, EventKind};

use super::activity::ActivityContext;

/// What a single item call reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The call did what was asked; the item is part of the result.
    Done,
    /// The item was deliberately left alone (not a failure).
    Skipped(String),
}

/// Semaphore-gated fan-out/fan-in.
#[derive(Debug, Clone, Copy)]
pub struct BoundedExecutor {
    limit: usize,
}

impl BoundedExecutor {
    /// `limit` is clamped to at least 1.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Runs `op` for every item, at most `limit` at a time, and returns the
    /// items whose call reported [`ItemOutcome::Done`].
    pub async fn run<T, F, Fut, E>(&self, ctx: &ActivityContext, items: Vec<T>, op: F) -> Vec<T>
    where
        T: Display + Send + 'static,
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<ItemOutcome, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if items.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut set = JoinSet::new();

        for item in items {
            let permit = select! {
                biased;
                _ = ctx.token().cancelled() => break,
                p = Arc::clone(&semaphore).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_closed) => break,
                },
            };
            let fut = op(&item);
            set.spawn(async move {
                let res = AssertUnwindSafe(fut).catch_unwind().await;
                drop(permit);
                (item, res)
            });
        }

        let mut done = Vec::new();
        while let Some(joined) = set.join_next().await {
            let Ok((item, res)) = joined else {
                continue;
            };
            match res {
                Ok(Ok(ItemOutcome::Done)) => done.push(item),
                Ok(Ok(ItemOutcome::Skipped(why))) => {
                    publish_item(ctx, EventKind::ItemSkipped, &item, why)
                }
                Ok(Err(e)) => publish_item(ctx, EventKind::ItemFailed, &item, e.to_string()),
                Err(_panic) => {
                    publish_item(ctx, EventKind::ItemFailed, &item, "call panicked".to_string())
                }
            }
        }
        done
    }
}

impl Default for BoundedExecutor {
    fn default() -> Self {
        Self::new(5)
    }
}

fn publish_item<T: Display>(ctx: &ActivityContext, kind: EventKind, item: &T, reason: String) {
    ctx.bus().publish(
        Event::new(kind)
            .with_stage(ctx.stage())
            .with_run(Arc::clone(ctx.run()))
            .with_resource(item.to_string())
            .with_reason(reason),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Gauge {
        now: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let n = self.now.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(n, Ordering::SeqCst);
        }
        fn leave(&self) {
            self.now.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn ctx(token: CancellationToken) -> ActivityContext {
        ActivityContext::new("deactivate", "run", 1, token, Bus::new(256))
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_limit() {
        let gauge = Arc::new(Gauge {
            now: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let items: Vec<u32> = (0..12).collect();

        let out = BoundedExecutor::new(3)
            .run(&ctx(CancellationToken::new()), items, |_| {
                let gauge = Arc::clone(&gauge);
                async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    gauge.leave();
                    Ok::<_, String>(ItemOutcome::Done)
                }
            })
            .await;

        assert_eq!(out.len(), 12);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_excluded() {
        let mut out = BoundedExecutor::new(2)
            .run(&ctx(CancellationToken::new()), vec![1u32, 2, 3, 4], |n| {
                let n = *n;
                async move {
                    match n {
                        2 => Err("power-off rejected".to_string()),
                        3 => panic!("inventory client bug"),
                        4 => Ok(ItemOutcome::Skipped("not powered on".into())),
                        _ => Ok(ItemOutcome::Done),
                    }
                }
            })
            .await;
        out.sort_unstable();
        assert_eq!(out, vec![1]);
    }

    #[tokio::test]
    async fn test_cancelled_token_dispatches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));

        let out = BoundedExecutor::new(2)
            .run(&ctx(token), vec![1u32, 2], |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(ItemOutcome::Done) }
            })
            .await;

        assert!(out.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
