//! Task-to-task channels. A channel is either bounded (capacity N) or
//! rendezvous (capacity 0, the sender completes only once the value is
//! taken). Closing a channel lets buffered values drain; receivers then
//! observe `ChanError::Closed`, the explicit form of a termination
//! sentinel.
//!
//! Channels never cross worker threads; cross-worker traffic goes over
//! the supervisor's IPC pipes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use thiserror::Error;

use crate::runtime::sched::{Executor, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChanError {
    /// The channel was closed and its buffer is drained.
    #[error("channel closed")]
    Closed,
    /// The receive deadline elapsed first.
    #[error("channel receive timed out")]
    Timeout,
}

struct Inner<T> {
    cap: usize,
    buf: VecDeque<T>,
    closed: bool,
    recv_wakers: Vec<Waker>,
    send_wakers: Vec<Waker>,
}

impl<T> Inner<T> {
    fn wake_receivers(&mut self) {
        for w in self.recv_wakers.drain(..) {
            w.wake();
        }
    }

    fn wake_senders(&mut self) {
        for w in self.send_wakers.drain(..) {
            w.wake();
        }
    }

    // Rendezvous channels park exactly one value in the buffer.
    fn slots(&self) -> usize {
        self.cap.max(1)
    }
}

pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    /// `capacity` 0 makes a rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cap: capacity,
                buf: VecDeque::new(),
                closed: false,
                recv_wakers: Vec::new(),
                send_wakers: Vec::new(),
            })),
        }
    }

    /// Close the channel. Buffered values still drain; subsequent
    /// receives surface `Closed`, blocked senders resume with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.wake_receivers();
        inner.wake_senders();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buf.is_empty()
    }

    /// Non-suspending send for callers outside a task context. Fails
    /// when the channel is closed or has no free slot right now.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed || inner.buf.len() >= inner.slots() {
            return Err(value);
        }
        inner.buf.push_back(value);
        inner.wake_receivers();
        Ok(())
    }

    /// Send a value, suspending while the channel is full. On a
    /// rendezvous channel this completes only after a receiver takes
    /// the value.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            ch: self,
            value: Some(value),
            pushed: false,
        }
    }

    /// Receive one value. `deadline` is an absolute monotonic
    /// millisecond deadline, -1 to wait forever.
    pub fn recv(&self, deadline: i64) -> Recv<'_, T> {
        Recv {
            ch: self,
            deadline,
            timer: None,
        }
    }

    /// Batch receive: up to `n` values, stopping early on close or
    /// deadline. The countdown-join primitive for fan-out senders.
    pub async fn recv_n(&self, n: usize, deadline: i64) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.recv(deadline).await {
                Ok(v) => out.push(v),
                Err(_) => break,
            }
        }
        out
    }
}

pub struct Send<'a, T> {
    ch: &'a Channel<T>,
    value: Option<T>,
    pushed: bool,
}

impl<'a, T> Future for Send<'a, T> {
    type Output = Result<(), ChanError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `Send` holds no self-referential data; none of its fields
        // are pinned, so it is safe to obtain a plain `&mut Self` even when
        // `T` is not `Unpin`.
        let this = unsafe { self.get_unchecked_mut() };
        let mut inner = this.ch.inner.borrow_mut();

        if !this.pushed {
            if inner.closed {
                return Poll::Ready(Err(ChanError::Closed));
            }
            if inner.buf.len() < inner.slots() {
                let rendezvous = inner.cap == 0;
                let value = this.value.take().expect("send polled after completion");
                inner.buf.push_back(value);
                inner.wake_receivers();
                if !rendezvous {
                    return Poll::Ready(Ok(()));
                }
                this.pushed = true;
                inner.send_wakers.push(cx.waker().clone());
                return Poll::Pending;
            }
            inner.send_wakers.push(cx.waker().clone());
            return Poll::Pending;
        }

        // Rendezvous: complete once the parked value was taken.
        if inner.buf.is_empty() {
            Poll::Ready(Ok(()))
        } else if inner.closed {
            Poll::Ready(Err(ChanError::Closed))
        } else {
            inner.send_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

pub struct Recv<'a, T> {
    ch: &'a Channel<T>,
    deadline: i64,
    timer: Option<u64>,
}

impl<'a, T> Future for Recv<'a, T> {
    type Output = Result<T, ChanError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.ch.inner.borrow_mut();

        if let Some(v) = inner.buf.pop_front() {
            inner.wake_senders();
            drop(inner);
            self.clear_timer();
            return Poll::Ready(Ok(v));
        }

        if inner.closed {
            drop(inner);
            self.clear_timer();
            return Poll::Ready(Err(ChanError::Closed));
        }

        if self.deadline >= 0 && now_ms() >= self.deadline {
            drop(inner);
            self.clear_timer();
            return Poll::Ready(Err(ChanError::Timeout));
        }

        inner.recv_wakers.push(cx.waker().clone());
        drop(inner);

        if self.deadline >= 0 {
            Executor::with_current(|ex| match self.timer {
                Some(id) => ex.reactor().update_timer_waker(id, cx.waker()),
                None => {
                    self.timer = Some(ex.reactor().add_timer(self.deadline, cx.waker().clone()));
                }
            });
        }
        Poll::Pending
    }
}

impl<'a, T> Recv<'a, T> {
    fn clear_timer(&mut self) {
        if let Some(id) = self.timer.take() {
            Executor::try_with_current(|ex| ex.reactor().cancel_timer(id));
        }
    }
}

impl<'a, T> Drop for Recv<'a, T> {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sched::{Executor, deadline_after, sleep};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn bounded_send_recv_in_order() {
        let ex = Executor::new().unwrap();
        let ch = Channel::new(4);
        let out = Rc::new(RefCell::new(Vec::new()));

        let tx = ch.clone();
        ex.spawn_on(async move {
            for i in 0..4 {
                tx.send(i).await.unwrap();
            }
            tx.close();
        });
        let out2 = out.clone();
        ex.spawn_on(async move {
            while let Ok(v) = ch.recv(-1).await {
                out2.borrow_mut().push(v);
            }
        });
        ex.run_until_complete();
        assert_eq!(*out.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn closed_channel_drains_then_reports_closed() {
        let ex = Executor::new().unwrap();
        let ch: Channel<u32> = Channel::new(8);
        ch.try_send(7).unwrap();
        ch.close();

        let out = Rc::new(RefCell::new(Vec::new()));
        let out2 = out.clone();
        ex.spawn_on(async move {
            assert_eq!(ch.recv(-1).await, Ok(7));
            assert_eq!(ch.recv(-1).await, Err(ChanError::Closed));
            out2.borrow_mut().push(true);
        });
        ex.run_until_complete();
        assert_eq!(out.borrow().len(), 1);
    }

    #[test]
    fn recv_deadline_fires() {
        let ex = Executor::new().unwrap();
        let ch: Channel<u32> = Channel::new(1);
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        ex.spawn_on(async move {
            let res = ch.recv(deadline_after(20)).await;
            *out2.borrow_mut() = Some(res);
        });
        ex.run_until_complete();
        assert_eq!(*out.borrow(), Some(Err(ChanError::Timeout)));
    }

    #[test]
    fn rendezvous_sender_waits_for_receiver() {
        let ex = Executor::new().unwrap();
        let ch = Channel::new(0);
        let order = Rc::new(RefCell::new(Vec::new()));

        let tx = ch.clone();
        let order_tx = order.clone();
        ex.spawn_on(async move {
            tx.send(1u32).await.unwrap();
            order_tx.borrow_mut().push("sent");
        });
        let order_rx = order.clone();
        ex.spawn_on(async move {
            sleep(10).await;
            order_rx.borrow_mut().push("recv");
            ch.recv(-1).await.unwrap();
        });
        ex.run_until_complete();
        assert_eq!(*order.borrow(), vec!["recv", "sent"]);
    }

    #[test]
    fn sender_blocks_until_capacity_frees() {
        let ex = Executor::new().unwrap();
        let ch = Channel::new(1);
        let done = Rc::new(RefCell::new(false));

        let tx = ch.clone();
        let done2 = done.clone();
        ex.spawn_on(async move {
            tx.send(1u32).await.unwrap();
            tx.send(2).await.unwrap(); // must suspend until first is taken
            *done2.borrow_mut() = true;
        });
        let vals = Rc::new(RefCell::new(Vec::new()));
        let vals2 = vals.clone();
        ex.spawn_on(async move {
            sleep(5).await;
            vals2.borrow_mut().push(ch.recv(-1).await.unwrap());
            vals2.borrow_mut().push(ch.recv(-1).await.unwrap());
        });
        ex.run_until_complete();
        assert!(*done.borrow());
        assert_eq!(*vals.borrow(), vec![1, 2]);
    }

    #[test]
    fn recv_n_collects_batch() {
        let ex = Executor::new().unwrap();
        let ch = Channel::new(16);
        for i in 0..5u32 {
            ch.try_send(i).unwrap();
        }
        let out = Rc::new(RefCell::new(Vec::new()));
        let out2 = out.clone();
        ex.spawn_on(async move {
            *out2.borrow_mut() = ch.recv_n(5, deadline_after(500)).await;
        });
        ex.run_until_complete();
        assert_eq!(out.borrow().len(), 5);
    }
}
