//! Single-threaded cooperative scheduler. One executor runs per worker
//! thread; tasks are plain futures polled from a FIFO ready queue and
//! suspend only at explicit points: fd waits, channel ops, sleeps and
//! yields. Nothing here migrates across threads.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{SuilError, SuilResult};
use crate::runtime::reactor::{FDW_IN, FDW_OUT, FdEvents, Reactor};
use crate::syscalls;

/// Direction a task wants to wait on an fd for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdInterest {
    Read,
    Write,
}

impl FdInterest {
    fn dir(self) -> u8 {
        match self {
            FdInterest::Read => FDW_IN,
            FdInterest::Write => FDW_OUT,
        }
    }
}

/// Monotonic now in milliseconds; deadlines across the crate are
/// absolute values of this clock, -1 meaning "no deadline".
pub fn now_ms() -> i64 {
    syscalls::monotonic_ms()
}

/// Absolute deadline `ms` milliseconds from now (-1 stays -1).
pub fn deadline_after(ms: i64) -> i64 {
    if ms < 0 { -1 } else { now_ms() + ms }
}

struct ReadyQueue {
    queue: Mutex<VecDeque<usize>>,
}

impl ReadyQueue {
    fn push(&self, id: usize) {
        self.queue.lock().unwrap().push_back(id);
    }

    fn pop(&self) -> Option<usize> {
        self.queue.lock().unwrap().pop_front()
    }

    fn has_ready(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

struct TaskWaker {
    id: usize,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

struct Task {
    future: Pin<Box<dyn Future<Output = ()>>>,
    waker: Waker,
}

pub struct Executor {
    tasks: RefCell<Vec<Option<Task>>>,
    free: RefCell<Vec<usize>>,
    ready: Arc<ReadyQueue>,
    reactor: Reactor,
    active: Cell<usize>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Executor>>> = const { RefCell::new(None) };
}

impl Executor {
    pub fn new() -> SuilResult<Rc<Self>> {
        Ok(Rc::new(Self {
            tasks: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            ready: Arc::new(ReadyQueue {
                queue: Mutex::new(VecDeque::new()),
            }),
            reactor: Reactor::new()?,
            active: Cell::new(0),
        }))
    }

    /// Run `f` with the executor installed on this thread, for the few
    /// callers that need runtime services outside `run_while`.
    pub fn enter<R>(self: &Rc<Self>, f: impl FnOnce() -> R) -> R {
        let _guard = CurrentGuard::install(self.clone());
        f()
    }

    pub(crate) fn with_current<R>(f: impl FnOnce(&Rc<Executor>) -> R) -> R {
        CURRENT.with(|c| {
            let cur = c.borrow();
            let ex = cur
                .as_ref()
                .expect("no suil executor is running on this thread");
            f(ex)
        })
    }

    pub(crate) fn try_with_current<R>(f: impl FnOnce(&Rc<Executor>) -> R) -> Option<R> {
        CURRENT.with(|c| c.borrow().as_ref().map(f))
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Enqueue a new task. Fire-and-forget: nothing about the task is
    /// observable from the outside.
    pub fn spawn_on(self: &Rc<Self>, fut: impl Future<Output = ()> + 'static) {
        let id = {
            let mut tasks = self.tasks.borrow_mut();
            match self.free.borrow_mut().pop() {
                Some(id) => id,
                None => {
                    tasks.push(None);
                    tasks.len() - 1
                }
            }
        };
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: self.ready.clone(),
        }));
        self.tasks.borrow_mut()[id] = Some(Task {
            future: Box::pin(fut),
            waker,
        });
        self.active.set(self.active.get() + 1);
        self.ready.push(id);
    }

    pub fn task_count(&self) -> usize {
        self.active.get()
    }

    fn poll_task(&self, id: usize) {
        let task = match self.tasks.borrow_mut().get_mut(id) {
            Some(slot) => slot.take(),
            None => None,
        };
        let Some(mut task) = task else {
            // Stale wakeup for a finished or re-used slot.
            return;
        };
        let waker = task.waker.clone();
        let mut cx = Context::from_waker(&waker);
        match task.future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.free.borrow_mut().push(id);
                self.active.set(self.active.get() - 1);
            }
            Poll::Pending => {
                self.tasks.borrow_mut()[id] = Some(task);
            }
        }
    }

    /// One scheduler pass: poll the tasks that are ready right now,
    /// then run the reactor. The drain is bounded by the queue length
    /// at entry so a yield-spinning task cannot starve I/O delivery.
    fn pass(&self, tick_cap: i64) -> bool {
        let mut budget = self.ready.len();
        while budget > 0 {
            match self.ready.pop() {
                Some(id) => self.poll_task(id),
                None => break,
            }
            budget -= 1;
        }
        if self.active.get() == 0 {
            // Nothing left that could be woken; don't sit in epoll.
            std::thread::sleep(std::time::Duration::from_millis(1));
            return true;
        }
        let timeout = if self.ready.has_ready() {
            0
        } else {
            self.reactor.next_timeout(now_ms(), tick_cap)
        };
        self.reactor.tick(timeout).is_ok()
    }

    /// Drive tasks until `keep_going` turns false. The predicate is
    /// re-checked at least every 200 milliseconds even when the
    /// reactor is idle.
    pub fn run_while(self: &Rc<Self>, keep_going: impl Fn() -> bool) {
        let _guard = CurrentGuard::install(self.clone());
        while keep_going() {
            if !self.pass(200) {
                break;
            }
        }
    }

    /// Drive until every spawned task has completed. Test and client
    /// entry point.
    pub fn run_until_complete(self: &Rc<Self>) {
        let _guard = CurrentGuard::install(self.clone());
        while self.active.get() > 0 {
            if !self.pass(200) {
                break;
            }
        }
    }

    /// Convenience: spawn `main` and run it (plus everything it spawns)
    /// to completion on a fresh executor.
    pub fn block_on(fut: impl Future<Output = ()> + 'static) -> SuilResult<()> {
        let ex = Executor::new()?;
        ex.spawn_on(fut);
        ex.run_until_complete();
        Ok(())
    }
}

struct CurrentGuard {
    prev: Option<Rc<Executor>>,
}

impl CurrentGuard {
    fn install(ex: Rc<Executor>) -> Self {
        let prev = CURRENT.with(|c| c.borrow_mut().replace(ex));
        CurrentGuard { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Spawn a task on the executor running on this thread.
pub fn spawn(fut: impl Future<Output = ()> + 'static) {
    Executor::with_current(|ex| ex.spawn_on(fut));
}

/// Re-queue the current task at the tail of the ready queue and let the
/// next ready task run.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Suspend the current task for `ms` milliseconds.
pub fn sleep(ms: i64) -> Sleep {
    sleep_until(deadline_after(ms.max(0)))
}

/// Suspend the current task until the absolute deadline.
pub fn sleep_until(deadline: i64) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

pub struct Sleep {
    deadline: i64,
    timer: Option<u64>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if now_ms() >= self.deadline {
            if let Some(id) = self.timer.take() {
                Executor::with_current(|ex| ex.reactor().cancel_timer(id));
            }
            return Poll::Ready(());
        }
        Executor::with_current(|ex| match self.timer {
            Some(id) => ex.reactor().update_timer_waker(id, cx.waker()),
            None => {
                self.timer = Some(ex.reactor().add_timer(self.deadline, cx.waker().clone()));
            }
        });
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            Executor::try_with_current(|ex| ex.reactor().cancel_timer(id));
        }
    }
}

/// Suspend until `fd` is ready in the given direction, the deadline
/// passes (`Err(Timeout)`) or someone calls [`fd_clear`] (the returned
/// event set has the error bit). Only one task may wait per
/// (fd, direction); a second wait panics.
pub fn fd_wait(fd: RawFd, interest: FdInterest, deadline: i64) -> FdWait {
    FdWait {
        fd,
        dir: interest.dir(),
        deadline,
        timer: None,
        registered: false,
        done: false,
    }
}

/// Wake whichever tasks are blocked on `fd` with an error event.
pub fn fd_clear(fd: RawFd) {
    Executor::with_current(|ex| ex.reactor().fd_clear(fd));
}

pub struct FdWait {
    fd: RawFd,
    dir: u8,
    deadline: i64,
    timer: Option<u64>,
    registered: bool,
    done: bool,
}

impl Future for FdWait {
    type Output = SuilResult<FdEvents>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Executor::with_current(|ex| {
            let reactor = ex.reactor();
            if !self.registered {
                reactor.register(self.fd, self.dir, cx.waker().clone());
                if self.deadline >= 0 {
                    self.timer = Some(reactor.add_timer(self.deadline, cx.waker().clone()));
                }
                self.registered = true;
                return Poll::Pending;
            }

            if let Some(events) = reactor.take_events(self.fd, self.dir) {
                if let Some(id) = self.timer.take() {
                    reactor.cancel_timer(id);
                }
                self.done = true;
                return Poll::Ready(Ok(events));
            }

            if self.deadline >= 0 && now_ms() >= self.deadline {
                reactor.deregister(self.fd, self.dir);
                if let Some(id) = self.timer.take() {
                    reactor.cancel_timer(id);
                }
                self.done = true;
                return Poll::Ready(Err(SuilError::Timeout));
            }

            reactor.update_waker(self.fd, self.dir, cx.waker());
            if let Some(id) = self.timer {
                reactor.update_timer_waker(id, cx.waker());
            }
            Poll::Pending
        })
    }
}

impl Drop for FdWait {
    fn drop(&mut self) {
        if self.registered && !self.done {
            let fd = self.fd;
            let dir = self.dir;
            let timer = self.timer.take();
            Executor::try_with_current(|ex| {
                ex.reactor().deregister(fd, dir);
                if let Some(id) = timer {
                    ex.reactor().cancel_timer(id);
                }
            });
        }
    }
}

/// Outcome of [`select2`].
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

/// Race two futures; the first to complete wins and the loser is
/// dropped (cancelling its registrations). This is the runtime's
/// `choose` combinator.
pub fn select2<A: Future, B: Future>(a: A, b: B) -> Select2<A, B> {
    Select2 { a, b }
}

pub struct Select2<A, B> {
    a: A,
    b: B,
}

impl<A: Future, B: Future> Future for Select2<A, B> {
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Both fields are structurally pinned; they are never moved out.
        let this = unsafe { self.get_unchecked_mut() };
        let a = unsafe { Pin::new_unchecked(&mut this.a) };
        if let Poll::Ready(v) = a.poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        let b = unsafe { Pin::new_unchecked(&mut this.b) };
        if let Poll::Ready(v) = b.poll(cx) {
            return Poll::Ready(Either::Right(v));
        }
        Poll::Pending
    }
}
