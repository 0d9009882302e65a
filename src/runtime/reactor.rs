//! Per-worker readiness source: a level-triggered epoll instance plus a
//! timer heap. At most one task may wait on a given (fd, direction) at
//! a time; the scheduler's `fd_wait` enforces that here.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::task::Waker;

use crate::error::SuilResult;
use crate::syscalls::{self, Epoll, epoll_event, EV_ERR, EV_IN, EV_OUT};

/// fd_wait direction/event bits.
pub const FDW_IN: u8 = 0x1;
pub const FDW_OUT: u8 = 0x2;
pub const FDW_ERR: u8 = 0x4;

/// The event set a completed `fd_wait` observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdEvents(pub u8);

impl FdEvents {
    pub fn readable(self) -> bool {
        self.0 & FDW_IN != 0
    }

    pub fn writable(self) -> bool {
        self.0 & FDW_OUT != 0
    }

    pub fn error(self) -> bool {
        self.0 & FDW_ERR != 0
    }
}

struct Waiter {
    waker: Waker,
    got: u8,
}

#[derive(Default)]
struct FdEntry {
    reader: Option<Waiter>,
    writer: Option<Waiter>,
    in_epoll: bool,
}

impl FdEntry {
    fn interest(&self) -> u32 {
        let mut ev = 0;
        if self.reader.is_some() {
            ev |= EV_IN;
        }
        if self.writer.is_some() {
            ev |= EV_OUT;
        }
        ev
    }
}

pub(crate) struct Reactor {
    epoll: Epoll,
    fds: RefCell<HashMap<RawFd, FdEntry>>,
    timers: RefCell<BinaryHeap<Reverse<(i64, u64)>>>,
    timer_wakers: RefCell<HashMap<u64, Waker>>,
    next_timer_id: Cell<u64>,
    events: RefCell<Vec<epoll_event>>,
}

impl Reactor {
    pub fn new() -> SuilResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            fds: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_wakers: RefCell::new(HashMap::new()),
            next_timer_id: Cell::new(1),
            events: RefCell::new(vec![epoll_event { events: 0, u64: 0 }; 256]),
        })
    }

    /// Park `waker` until `fd` is ready in direction `dir`. Two tasks
    /// waiting on the same (fd, direction) is a programmer error.
    pub fn register(&self, fd: RawFd, dir: u8, waker: Waker) {
        let mut fds = self.fds.borrow_mut();
        let entry = fds.entry(fd).or_default();
        let slot = if dir == FDW_IN {
            &mut entry.reader
        } else {
            &mut entry.writer
        };
        if slot.is_some() {
            panic!("fd {fd} already has a task waiting for direction {dir:#x}");
        }
        *slot = Some(Waiter { waker, got: 0 });
        self.sync_epoll(fd, entry);
    }

    /// Consume delivered events for (fd, dir), removing the waiter.
    pub fn take_events(&self, fd: RawFd, dir: u8) -> Option<FdEvents> {
        let mut fds = self.fds.borrow_mut();
        let entry = fds.get_mut(&fd)?;
        let slot = if dir == FDW_IN {
            &mut entry.reader
        } else {
            &mut entry.writer
        };
        match slot {
            Some(w) if w.got != 0 => {
                let got = w.got;
                *slot = None;
                self.sync_epoll(fd, entry);
                if entry.reader.is_none() && entry.writer.is_none() {
                    fds.remove(&fd);
                }
                Some(FdEvents(got))
            }
            _ => None,
        }
    }

    /// Drop the waiter for (fd, dir) without delivering anything.
    pub fn deregister(&self, fd: RawFd, dir: u8) {
        let mut fds = self.fds.borrow_mut();
        if let Some(entry) = fds.get_mut(&fd) {
            if dir == FDW_IN {
                entry.reader = None;
            } else {
                entry.writer = None;
            }
            self.sync_epoll(fd, entry);
            if entry.reader.is_none() && entry.writer.is_none() {
                fds.remove(&fd);
            }
        }
    }

    /// Refresh the stored waker; polls may arrive through a different
    /// composed future (select2) than the one that registered.
    pub fn update_waker(&self, fd: RawFd, dir: u8, waker: &Waker) {
        let mut fds = self.fds.borrow_mut();
        if let Some(entry) = fds.get_mut(&fd) {
            let slot = if dir == FDW_IN {
                &mut entry.reader
            } else {
                &mut entry.writer
            };
            if let Some(w) = slot {
                w.waker.clone_from(waker);
            }
        }
    }

    /// Wake any waiter on `fd` with the ERR event. This is the
    /// cancellation hook: the blocked task resumes, observes the error
    /// and unwinds through its normal return path.
    pub fn fd_clear(&self, fd: RawFd) {
        let mut fds = self.fds.borrow_mut();
        if let Some(entry) = fds.get_mut(&fd) {
            for slot in [&mut entry.reader, &mut entry.writer] {
                if let Some(w) = slot {
                    w.got |= FDW_ERR;
                    w.waker.wake_by_ref();
                }
            }
        }
    }

    fn sync_epoll(&self, fd: RawFd, entry: &mut FdEntry) {
        let interest = entry.interest();
        if interest == 0 {
            if entry.in_epoll {
                let _ = self.epoll.delete(fd);
                entry.in_epoll = false;
            }
        } else if entry.in_epoll {
            let _ = self.epoll.modify(fd, fd as u64, interest);
        } else if self.epoll.add(fd, fd as u64, interest).is_ok() {
            entry.in_epoll = true;
        }
    }

    pub fn add_timer(&self, deadline: i64, waker: Waker) -> u64 {
        let id = self.next_timer_id.get();
        self.next_timer_id.set(id + 1);
        self.timers.borrow_mut().push(Reverse((deadline, id)));
        self.timer_wakers.borrow_mut().insert(id, waker);
        id
    }

    pub fn cancel_timer(&self, id: u64) {
        // Heap entries are skipped lazily once the waker is gone.
        self.timer_wakers.borrow_mut().remove(&id);
    }

    pub fn update_timer_waker(&self, id: u64, waker: &Waker) {
        if let Some(w) = self.timer_wakers.borrow_mut().get_mut(&id) {
            w.clone_from(waker);
        }
    }

    /// Milliseconds until the nearest live timer, clamped to `cap`.
    pub fn next_timeout(&self, now: i64, cap: i64) -> i64 {
        let wakers = self.timer_wakers.borrow();
        let mut timers = self.timers.borrow_mut();
        while let Some(Reverse((deadline, id))) = timers.peek().copied() {
            if !wakers.contains_key(&id) {
                timers.pop();
                continue;
            }
            return (deadline - now).clamp(0, cap);
        }
        cap
    }

    /// One reactor pass: block in epoll up to `timeout_ms`, deliver fd
    /// events and fire due timers.
    pub fn tick(&self, timeout_ms: i64) -> SuilResult<()> {
        let n = {
            let mut events = self.events.borrow_mut();
            self.epoll.wait(&mut events, timeout_ms as i32)?
        };

        let events = self.events.borrow();
        let mut fds = self.fds.borrow_mut();
        for ev in events[..n].iter() {
            let fd = ev.u64 as RawFd;
            let Some(entry) = fds.get_mut(&fd) else {
                continue;
            };
            if ev.events & (EV_IN | EV_ERR) != 0 {
                if let Some(w) = entry.reader.as_mut() {
                    if ev.events & EV_IN != 0 {
                        w.got |= FDW_IN;
                    }
                    if ev.events & EV_ERR != 0 {
                        w.got |= FDW_ERR;
                    }
                    w.waker.wake_by_ref();
                }
            }
            if ev.events & (EV_OUT | EV_ERR) != 0 {
                if let Some(w) = entry.writer.as_mut() {
                    if ev.events & EV_OUT != 0 {
                        w.got |= FDW_OUT;
                    }
                    if ev.events & EV_ERR != 0 {
                        w.got |= FDW_ERR;
                    }
                    w.waker.wake_by_ref();
                }
            }
        }
        drop(fds);
        drop(events);

        self.fire_timers(syscalls::monotonic_ms());
        Ok(())
    }

    fn fire_timers(&self, now: i64) {
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(&Reverse((deadline, id))) if deadline <= now => {
                        timers.pop();
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = due else { break };
            if let Some(waker) = self.timer_wakers.borrow_mut().remove(&id) {
                waker.wake();
            }
        }
    }
}
