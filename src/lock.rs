//! FIFO ticket locks shared between workers. A waiter takes a ticket
//! from `next` and spin-yields until `serving` reaches it, so the lock
//! never blocks the OS thread; each spin iteration suspends into the
//! task runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::runtime::yield_now;

/// Number of locks in a pool. Lock 0 is reserved for accept
/// arbitration; the rest are free for user code.
pub const POOL_LOCKS: usize = 64;

pub struct TicketLock {
    next: AtomicU32,
    serving: AtomicU32,
    on: AtomicBool,
}

impl TicketLock {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            on: AtomicBool::new(true),
        }
    }

    /// Take a ticket and wait for it to be served. Returns false when
    /// the lock was shut down while waiting.
    pub async fn acquire(&self) -> bool {
        let ticket = self.next.fetch_add(1, Ordering::AcqRel);
        while self.serving.load(Ordering::Acquire) != ticket {
            if !self.on.load(Ordering::Acquire) {
                return false;
            }
            yield_now().await;
        }
        self.on.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.serving.fetch_add(1, Ordering::AcqRel);
    }

    /// Shut the lock down; current and future waiters bail out with
    /// `false` from `acquire`.
    pub fn shutdown(&self) {
        self.on.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
        self.serving.store(0, Ordering::Release);
        self.on.store(true, Ordering::Release);
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed pool of ticket locks shared by all workers.
pub struct LockPool {
    locks: Vec<TicketLock>,
}

impl LockPool {
    pub fn new() -> Arc<Self> {
        let mut locks = Vec::with_capacity(POOL_LOCKS);
        for _ in 0..POOL_LOCKS {
            locks.push(TicketLock::new());
        }
        Arc::new(Self { locks })
    }

    /// The accept-arbitration lock.
    pub fn accept(&self) -> &TicketLock {
        &self.locks[0]
    }

    /// A user lock; index 0 is reserved.
    pub fn get(&self, index: usize) -> Option<&TicketLock> {
        if index == 0 { None } else { self.locks.get(index) }
    }

    pub fn shutdown_all(&self) {
        for lock in &self.locks {
            lock.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Executor;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn lock_serializes_critical_sections() {
        let ex = Executor::new().unwrap();
        let lock = Rc::new(TicketLock::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        for id in 0..3 {
            let lock = lock.clone();
            let log = log.clone();
            ex.spawn_on(async move {
                assert!(lock.acquire().await);
                log.borrow_mut().push((id, "in"));
                crate::runtime::yield_now().await;
                log.borrow_mut().push((id, "out"));
                lock.release();
            });
        }
        ex.run_until_complete();

        // Entries must pair up: no task enters before the holder left.
        let log = log.borrow();
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "in");
            assert_eq!(pair[1].1, "out");
        }
    }

    #[test]
    fn fifo_ticket_order() {
        let ex = Executor::new().unwrap();
        let lock = Rc::new(TicketLock::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        for id in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            ex.spawn_on(async move {
                assert!(lock.acquire().await);
                order.borrow_mut().push(id);
                lock.release();
            });
        }
        ex.run_until_complete();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn shutdown_aborts_waiters() {
        let ex = Executor::new().unwrap();
        let lock = Rc::new(TicketLock::new());
        let got = Rc::new(RefCell::new(None));

        let l = lock.clone();
        let g = got.clone();
        ex.spawn_on(async move {
            assert!(l.acquire().await); // holder never releases
            let l2 = l.clone();
            crate::runtime::spawn(async move {
                *g.borrow_mut() = Some(l2.acquire().await);
            });
            crate::runtime::yield_now().await;
            l.shutdown();
        });
        ex.run_until_complete();
        assert_eq!(*got.borrow(), Some(false));
    }

    #[test]
    fn pool_reserves_accept_lock() {
        let pool = LockPool::new();
        assert!(pool.get(0).is_none());
        assert!(pool.get(1).is_some());
        assert!(pool.get(POOL_LOCKS).is_none());
    }
}
