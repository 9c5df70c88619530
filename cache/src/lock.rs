//! Per-block reader/writer lock.
//!
//! Cooperative, not OS-thread-blocking: a waiter suspends on a
//! `tokio::sync::Notify` rather than parking a thread, matching how the
//! rest of this crate treats suspension points as async awaits (Design
//! Note "Cooperative suspension"). Waiters queue FIFO in a plain
//! `VecDeque` guarded by a `std::sync::Mutex` — the cache's state lives
//! on one home thread, so there is never contention on
//! this mutex beyond a single in-flight grant pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    ReadSync,
    /// Pins the current data via `cow_refcount` and releases immediately;
    /// see [`BlockLock::acquire_read_outdated_ok`].
    ReadOutdatedOk,
    Write,
}

fn compatible(held: &[LockMode], requested: LockMode) -> bool {
    match requested {
        LockMode::Write => held.is_empty(),
        LockMode::Read | LockMode::ReadSync => {
            held.iter().all(|m| matches!(m, LockMode::Read | LockMode::ReadSync))
        }
        LockMode::ReadOutdatedOk => true,
    }
}

struct Waiter {
    mode: LockMode,
    granted: Arc<AtomicBool>,
    notify: Arc<Notify>,
    in_line: Arc<AtomicBool>,
    in_line_notify: Arc<Notify>,
}

struct State {
    held: Vec<LockMode>,
    queue: VecDeque<Waiter>,
}

/// A FIFO reader/writer lock for one inner buffer. `intent` and
/// `upgrade` modes are not implemented and calling
/// [`BlockLock::acquire`] with them panics.
pub struct BlockLock {
    state: Mutex<State>,
}

/// A held guard borrowing the lock directly. Used by this module's own
/// tests; callers holding the lock across an `Arc<InnerBuffer>` boundary
/// should go through [`BlockLock::acquire_owned`] instead, since a
/// borrowed guard can't outlive the borrow that produced it.
pub struct LockGuard<'a> {
    lock: &'a BlockLock,
    mode: LockMode,
    released: bool,
}

impl Default for BlockLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLock {
    pub fn new() -> Self {
        Self { state: Mutex::new(State { held: Vec::new(), queue: VecDeque::new() }) }
    }

    /// Whether any mode is currently held.
    pub fn is_held(&self) -> bool {
        !self.state.lock().unwrap().held.is_empty()
    }

    /// Suspends until `mode` is granted, optionally invoking `on_in_line`
    /// once this request reaches the head of the wait queue (before the
    /// grant itself completes), so callers can pipeline follow-up work
    /// Returns nothing; the caller is responsible for
    /// calling [`Self::release`] with the same mode exactly once.
    async fn wait_for_grant(&self, mode: LockMode, on_in_line: Option<impl FnOnce()>) {
        assert!(
            !matches!(mode, LockMode::ReadOutdatedOk),
            "read-outdated-ok must go through acquire_read_outdated_ok"
        );

        let (granted, notify, in_line, in_line_notify) = {
            let mut state = self.state.lock().unwrap();
            let waiter = Waiter {
                mode,
                granted: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
                in_line: Arc::new(AtomicBool::new(false)),
                in_line_notify: Arc::new(Notify::new()),
            };
            let handles = (
                Arc::clone(&waiter.granted),
                Arc::clone(&waiter.notify),
                Arc::clone(&waiter.in_line),
                Arc::clone(&waiter.in_line_notify),
            );
            state.queue.push_back(waiter);
            run_grant_pass(&mut state);
            handles
        };

        match on_in_line {
            Some(cb) => {
                while !in_line.load(Ordering::Acquire) {
                    in_line_notify.notified().await;
                }
                cb();
            }
            None => {
                while !in_line.load(Ordering::Acquire) && !granted.load(Ordering::Acquire) {
                    in_line_notify.notified().await;
                }
            }
        }
        while !granted.load(Ordering::Acquire) {
            notify.notified().await;
        }
    }

    /// Acquires the lock in `mode`, suspending until granted.
    pub async fn acquire(&self, mode: LockMode) -> LockGuard<'_> {
        self.wait_for_grant(mode, None::<fn()>).await;
        LockGuard { lock: self, mode, released: false }
    }

    /// Same as [`Self::acquire`], but also resolves `on_in_line` when the
    /// request reaches the head of line, before the grant itself lands.
    pub async fn acquire_with_in_line_hook(&self, mode: LockMode, on_in_line: impl FnOnce()) -> LockGuard<'_> {
        self.wait_for_grant(mode, Some(on_in_line)).await;
        LockGuard { lock: self, mode, released: false }
    }

    /// Like [`Self::acquire`], but returns only the granted mode rather
    /// than a borrowed guard, for callers that need to pair the
    /// acquisition with an owned handle (e.g. `Arc<InnerBuffer>`) instead
    /// of a borrow. The caller must call [`Self::release`] exactly once.
    pub async fn acquire_owned(&self, mode: LockMode) -> LockMode {
        self.wait_for_grant(mode, None::<fn()>).await;
        mode
    }

    /// Same as [`Self::acquire_owned`], but also resolves `on_in_line`
    /// once this request reaches the head of the wait queue, before the
    /// grant itself lands.
    pub async fn acquire_owned_with_in_line_hook(&self, mode: LockMode, on_in_line: impl FnOnce()) -> LockMode {
        self.wait_for_grant(mode, Some(on_in_line)).await;
        mode
    }

    /// Takes a read lock only long enough to observe the data is present,
    /// incrementing `cow_refcount` via the caller's supplied closure, then
    /// releases before returning. Subsequent writers snapshot rather than
    /// block behind this reader.
    pub async fn acquire_read_outdated_ok(&self, pin: impl FnOnce()) {
        let guard = self.acquire(LockMode::Read).await;
        pin();
        drop(guard);
    }

    /// Releases one held instance of `mode` and runs the grant loop for
    /// the next compatible run of waiters. Must be paired with a prior
    /// `acquire`/`acquire_owned` call for the same mode.
    pub(crate) fn release(&self, mode: LockMode) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.held.iter().position(|m| *m == mode) {
            state.held.remove(pos);
        }
        run_grant_pass(&mut state);
    }
}

/// Grants the longest prefix of compatible waiters at the front of the
/// queue. A queued writer blocks behind any holder but, once granted,
/// also blocks subsequent queued readers from jumping ahead of it —
/// FIFO order is the queue order, not "readers whenever possible".
fn run_grant_pass(state: &mut State) {
    loop {
        let Some(front) = state.queue.front() else { break };
        if !compatible(&state.held, front.mode) {
            break;
        }
        let waiter = state.queue.pop_front().unwrap();
        state.held.push(waiter.mode);
        waiter.in_line.store(true, Ordering::Release);
        waiter.in_line_notify.notify_one();
        waiter.granted.store(true, Ordering::Release);
        waiter.notify.notify_one();
        // A write lock is exclusive; nothing else can be granted behind
        // it in the same pass.
        if waiter.mode == LockMode::Write {
            break;
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release(self.mode);
        }
    }
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_share_the_lock() {
        let lock = BlockLock::new();
        let g1 = lock.acquire(LockMode::Read).await;
        let g2 = lock.acquire(LockMode::Read).await;
        assert_eq!(g1.mode(), LockMode::Read);
        assert_eq!(g2.mode(), LockMode::Read);
    }

    #[tokio::test]
    async fn writer_excludes_further_grants_until_release() {
        let lock = Arc::new(BlockLock::new());
        let w = lock.acquire(LockMode::Write).await;

        let lock2 = Arc::clone(&lock);
        let handle = tokio::spawn(async move {
            let _r = lock2.acquire(LockMode::Read).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(w);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn queued_writer_blocks_later_readers_fifo() {
        let lock = Arc::new(BlockLock::new());
        let r0 = lock.acquire(LockMode::Read).await;

        let order = Arc::new(Mutex::new(Vec::new()));

        let lock_w = Arc::clone(&lock);
        let order_w = Arc::clone(&order);
        let writer = tokio::spawn(async move {
            let _g = lock_w.acquire(LockMode::Write).await;
            order_w.lock().unwrap().push("write");
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let lock_r = Arc::clone(&lock);
        let order_r = Arc::clone(&order);
        let reader = tokio::spawn(async move {
            let _g = lock_r.acquire(LockMode::Read).await;
            order_r.lock().unwrap().push("read");
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        drop(r0);
        writer.await.unwrap();
        reader.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["write", "read"]);
    }

    #[tokio::test]
    async fn in_line_hook_fires_while_queued() {
        let lock = Arc::new(BlockLock::new());
        let w = lock.acquire(LockMode::Write).await;

        let lock2 = Arc::clone(&lock);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let handle = tokio::spawn(async move {
            lock2.acquire_owned_with_in_line_hook(LockMode::Read, move || fired2.store(true, Ordering::SeqCst)).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        // Still queued behind the write lock, so the hook hasn't run yet.
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!handle.is_finished());

        drop(w);
        let mode = handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(mode, LockMode::Read);
    }
}
