//! The cooperative scheduling boundary.
//!
//! Task spawning and suspension are treated as an external collaborator
//! rather than something the cache owns outright: a [`Scheduler`] is
//! the handle a `Cache` uses for the two things it still needs a
//! runtime for beyond a plain `.await` — detaching a background task
//! from the caller that triggered it, and cooperatively yielding
//! during a drain loop. [`TokioScheduler`] is the reference
//! implementation, backed by the `tokio` runtime already driving every
//! `async fn` in this crate.

use std::future::Future;
use std::pin::Pin;

pub trait Scheduler: Send + Sync {
    /// Detaches `fut`, running it to completion independently of the
    /// caller. Used for background flush passes and for a
    /// [`crate::transaction::Transactor`]'s commit-on-drop, neither of
    /// which can be awaited from the context that triggers them.
    fn spawn_detached(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>);

    /// Cooperatively yields to other work queued on this scheduler.
    /// Used by [`crate::cache::Cache::shutdown`]'s drain loop, which
    /// polls `live_txn_count` down to zero rather than awaiting a
    /// single future.
    async fn yield_now(&self);
}

/// The `tokio`-backed [`Scheduler`]: `spawn_detached` is `tokio::spawn`,
/// `yield_now` is `tokio::task::yield_now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn spawn_detached(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(fut);
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
