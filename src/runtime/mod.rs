//! Cooperative task runtime: one single-threaded executor per worker,
//! epoll-backed fd waits with deadlines, timers and channels.

pub mod channel;
pub mod reactor;
pub mod sched;

pub use channel::{ChanError, Channel};
pub use reactor::FdEvents;
pub use sched::{
    Either, Executor, FdInterest, deadline_after, fd_clear, fd_wait, now_ms, select2, sleep,
    sleep_until, spawn, yield_now,
};
