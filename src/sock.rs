//! Socket adaptors. All operations suspend on the task runtime; no
//! blocking syscall ever reaches the OS. `TcpSock` is the plain-TCP
//! adaptor; an encrypting adaptor would implement the same trait and
//! report `supports_sendfile() == false`, which callers must probe
//! before attempting zero-copy transmission.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

use tracing::trace;

use crate::error::{SuilError, SuilResult};
use crate::runtime::{FdInterest, fd_wait};
use crate::syscalls;

const SEND_BUF_SIZE: usize = 8192;
const RECV_CHUNK: usize = 4096;

pub trait SocketAdaptor {
    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Whether this adaptor can transmit a file with a zero-copy kernel
    /// primitive. Callers fall back to buffered sends when false.
    fn supports_sendfile(&self) -> bool {
        false
    }

    /// Queue `buf` for transmission, flushing as needed. Returns the
    /// number of bytes accepted (always `buf.len()` on success).
    async fn send(&mut self, buf: &[u8], deadline: i64) -> SuilResult<usize>;

    /// Drain the send buffer to the wire.
    async fn flush(&mut self, deadline: i64) -> SuilResult<()>;

    /// Receive up to `buf.len()` bytes. Returns 0 at end of stream.
    async fn recv(&mut self, buf: &mut [u8], deadline: i64) -> SuilResult<usize>;

    /// Receive exactly `buf.len()` bytes or fail.
    async fn recv_exact(&mut self, buf: &mut [u8], deadline: i64) -> SuilResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..], deadline).await?;
            if n == 0 {
                return Err(SuilError::Closed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Receive until `delim` is seen (inclusive) or `max` bytes arrive.
    async fn recv_until(&mut self, delim: &[u8], max: usize, deadline: i64)
    -> SuilResult<Vec<u8>>;

    /// Transmit `len` bytes of `file_fd` starting at `offset`.
    async fn sendfile(
        &mut self,
        file_fd: RawFd,
        offset: i64,
        len: usize,
        deadline: i64,
    ) -> SuilResult<usize> {
        let _ = (file_fd, offset, len, deadline);
        Err(SuilError::Unsupported("sendfile"))
    }
}

pub struct TcpSock {
    fd: RawFd,
    open: bool,
    tx: Vec<u8>,
    stash: Vec<u8>,
    stash_pos: usize,
}

impl TcpSock {
    pub fn from_fd(fd: RawFd) -> Self {
        Self {
            fd,
            open: true,
            tx: Vec::new(),
            stash: Vec::new(),
            stash_pos: 0,
        }
    }

    /// Connect to `addr`, suspending until the handshake completes or
    /// the deadline passes.
    pub async fn connect(addr: SocketAddr, deadline: i64) -> SuilResult<Self> {
        let (fd, connected) = syscalls::start_connect(&addr)?;
        let mut sock = Self::from_fd(fd);
        if !connected {
            let ev = fd_wait(fd, FdInterest::Write, deadline).await?;
            let err = syscalls::socket_error(fd)?;
            if err != 0 || ev.error() {
                sock.close();
                let errno = if err != 0 { err } else { libc::ECONNREFUSED };
                return Err(io::Error::from_raw_os_error(errno).into());
            }
        }
        trace!(fd, %addr, "connected");
        Ok(sock)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn fail(&mut self, err: SuilError) -> SuilError {
        // A reset peer leaves the adaptor unusable.
        if let SuilError::Io(ref e) = err {
            if e.kind() == io::ErrorKind::ConnectionReset {
                self.close();
            }
        }
        err
    }

    async fn write_direct(&mut self, buf: &[u8], deadline: i64) -> SuilResult<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match syscalls::write_nonblocking(self.fd, &buf[sent..]) {
                Ok(Some(n)) => sent += n,
                Ok(None) => {
                    let ev = fd_wait(self.fd, FdInterest::Write, deadline).await?;
                    if ev.error() {
                        self.close();
                        return Err(SuilError::Closed);
                    }
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(())
    }

    /// Bytes received but not yet consumed (recv_until leftovers or
    /// bytes pushed back by a protocol switch).
    pub fn has_buffered(&self) -> bool {
        self.stash.len() > self.stash_pos
    }

    /// Push already-received bytes back in front of the stream; the
    /// next recv returns them first.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut stash = Vec::with_capacity(bytes.len() + self.stash.len() - self.stash_pos);
        stash.extend_from_slice(bytes);
        stash.extend_from_slice(&self.stash[self.stash_pos..]);
        self.stash = stash;
        self.stash_pos = 0;
    }

    fn stash_take(&mut self, buf: &mut [u8]) -> usize {
        let avail = self.stash.len() - self.stash_pos;
        if avail == 0 {
            return 0;
        }
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.stash[self.stash_pos..self.stash_pos + n]);
        self.stash_pos += n;
        if self.stash_pos == self.stash.len() {
            self.stash.clear();
            self.stash_pos = 0;
        }
        n
    }

    async fn fill_stash(&mut self, deadline: i64) -> SuilResult<usize> {
        loop {
            let old = self.stash.len();
            self.stash.resize(old + RECV_CHUNK, 0);
            match syscalls::read_nonblocking(self.fd, &mut self.stash[old..]) {
                Ok(Some(n)) => {
                    self.stash.truncate(old + n);
                    return Ok(n);
                }
                Ok(None) => {
                    self.stash.truncate(old);
                    let ev = fd_wait(self.fd, FdInterest::Read, deadline).await?;
                    if ev.error() && !ev.readable() {
                        self.close();
                        return Err(SuilError::Closed);
                    }
                }
                Err(e) => {
                    self.stash.truncate(old);
                    return Err(self.fail(e));
                }
            }
        }
    }
}

impl SocketAdaptor for TcpSock {
    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            syscalls::close_fd(self.fd);
            self.open = false;
        }
    }

    fn supports_sendfile(&self) -> bool {
        true
    }

    async fn send(&mut self, buf: &[u8], deadline: i64) -> SuilResult<usize> {
        if !self.open {
            return Err(SuilError::Closed);
        }
        if buf.len() >= SEND_BUF_SIZE {
            self.flush(deadline).await?;
            self.write_direct(buf, deadline).await?;
            return Ok(buf.len());
        }
        if self.tx.len() + buf.len() > SEND_BUF_SIZE {
            self.flush(deadline).await?;
        }
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self, deadline: i64) -> SuilResult<()> {
        if self.tx.is_empty() {
            return Ok(());
        }
        if !self.open {
            return Err(SuilError::Closed);
        }
        let pending = mem::take(&mut self.tx);
        let res = self.write_direct(&pending, deadline).await;
        if res.is_err() {
            // Keep unsent bytes so a caller retry is possible.
            self.tx = pending;
        }
        res
    }

    async fn recv(&mut self, buf: &mut [u8], deadline: i64) -> SuilResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.stash_take(buf);
        if n > 0 {
            return Ok(n);
        }
        if !self.open {
            return Err(SuilError::Closed);
        }
        loop {
            match syscalls::read_nonblocking(self.fd, buf) {
                Ok(Some(n)) => return Ok(n),
                Ok(None) => {
                    let ev = fd_wait(self.fd, FdInterest::Read, deadline).await?;
                    if ev.error() && !ev.readable() {
                        self.close();
                        return Err(SuilError::Closed);
                    }
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    async fn recv_until(
        &mut self,
        delim: &[u8],
        max: usize,
        deadline: i64,
    ) -> SuilResult<Vec<u8>> {
        loop {
            let window = &self.stash[self.stash_pos..];
            if let Some(pos) = window
                .windows(delim.len().max(1))
                .position(|w| w == delim)
            {
                let end = self.stash_pos + pos + delim.len();
                let out = self.stash[self.stash_pos..end].to_vec();
                self.stash_pos = end;
                if self.stash_pos == self.stash.len() {
                    self.stash.clear();
                    self.stash_pos = 0;
                }
                return Ok(out);
            }
            if window.len() >= max {
                return Err(SuilError::proto("delimiter not found within limit"));
            }
            if self.fill_stash(deadline).await? == 0 {
                return Err(SuilError::Closed);
            }
        }
    }

    async fn sendfile(
        &mut self,
        file_fd: RawFd,
        offset: i64,
        len: usize,
        deadline: i64,
    ) -> SuilResult<usize> {
        if !self.open {
            return Err(SuilError::Closed);
        }
        self.flush(deadline).await?;
        let mut off = offset;
        let end = offset + len as i64;
        while off < end {
            let left = (end - off) as usize;
            match syscalls::sendfile_nonblocking(self.fd, file_fd, &mut off, left) {
                Ok(Some(0)) => break,
                Ok(Some(_)) => {}
                Ok(None) => {
                    let ev = fd_wait(self.fd, FdInterest::Write, deadline).await?;
                    if ev.error() {
                        self.close();
                        return Err(SuilError::Closed);
                    }
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok((off - offset) as usize)
    }
}

impl Drop for TcpSock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening socket. The supervisor creates one and every worker
/// accepts from it behind the accept lock.
pub struct TcpServerSock {
    fd: RawFd,
    owned: bool,
}

impl TcpServerSock {
    pub fn listen(addr: &SocketAddr, backlog: i32) -> SuilResult<Self> {
        let fd = syscalls::create_listen_socket(addr, backlog)?;
        Ok(Self { fd, owned: true })
    }

    /// Borrow an already-listening fd owned elsewhere (the supervisor).
    pub fn from_shared(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The bound address; port 0 listeners resolve to the kernel pick.
    pub fn local_addr(&self) -> SuilResult<SocketAddr> {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                < 0
            {
                return Err(io::Error::last_os_error().into());
            }
            match storage.ss_family as i32 {
                libc::AF_INET => {
                    let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                    // s_addr is network order; its memory bytes are the
                    // address octets.
                    Ok(SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())),
                        u16::from_be(sin.sin_port),
                    ))
                }
                libc::AF_INET6 => {
                    let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                    Ok(SocketAddr::new(
                        IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                        u16::from_be(sin6.sin6_port),
                    ))
                }
                other => Err(SuilError::Other(format!("unexpected address family {other}"))),
            }
        }
    }

    /// Accept one connection, suspending until a peer arrives or the
    /// deadline passes.
    pub async fn accept(&self, deadline: i64) -> SuilResult<TcpSock> {
        loop {
            match syscalls::accept_connection(self.fd)? {
                Some(fd) => return Ok(TcpSock::from_fd(fd)),
                None => {
                    let ev = fd_wait(self.fd, FdInterest::Read, deadline).await?;
                    if ev.error() && !ev.readable() {
                        return Err(SuilError::Closed);
                    }
                }
            }
        }
    }
}

impl Drop for TcpServerSock {
    fn drop(&mut self) {
        if self.owned {
            syscalls::close_fd(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Executor, deadline_after};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn listen_accept_send_recv() {
        let ex = Executor::new().unwrap();
        let server = Rc::new(TcpServerSock::listen(&loopback(), 16).unwrap());
        let addr = server.local_addr().unwrap();
        let echoed = Rc::new(RefCell::new(Vec::new()));

        let srv = server.clone();
        ex.spawn_on(async move {
            let mut sock = srv.accept(deadline_after(2000)).await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.recv(&mut buf, deadline_after(2000)).await.unwrap();
            sock.send(&buf[..n], deadline_after(2000)).await.unwrap();
            sock.flush(deadline_after(2000)).await.unwrap();
        });

        let out = echoed.clone();
        ex.spawn_on(async move {
            let mut sock = TcpSock::connect(addr, deadline_after(2000)).await.unwrap();
            sock.send(b"hello", deadline_after(2000)).await.unwrap();
            sock.flush(deadline_after(2000)).await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.recv(&mut buf, deadline_after(2000)).await.unwrap();
            out.borrow_mut().extend_from_slice(&buf[..n]);
        });

        ex.run_until_complete();
        assert_eq!(&*echoed.borrow(), b"hello");
    }

    #[test]
    fn recv_until_splits_at_delimiter() {
        let ex = Executor::new().unwrap();
        let server = Rc::new(TcpServerSock::listen(&loopback(), 16).unwrap());
        let addr = server.local_addr().unwrap();
        let lines = Rc::new(RefCell::new(Vec::new()));

        let srv = server.clone();
        let lines2 = lines.clone();
        ex.spawn_on(async move {
            let mut sock = srv.accept(deadline_after(2000)).await.unwrap();
            let a = sock
                .recv_until(b"\r\n", 1024, deadline_after(2000))
                .await
                .unwrap();
            let b = sock
                .recv_until(b"\r\n", 1024, deadline_after(2000))
                .await
                .unwrap();
            lines2.borrow_mut().push(a);
            lines2.borrow_mut().push(b);
        });

        ex.spawn_on(async move {
            let mut sock = TcpSock::connect(addr, deadline_after(2000)).await.unwrap();
            sock.send(b"one\r\ntwo\r\n", deadline_after(2000)).await.unwrap();
            sock.flush(deadline_after(2000)).await.unwrap();
        });

        ex.run_until_complete();
        let lines = lines.borrow();
        assert_eq!(lines[0], b"one\r\n");
        assert_eq!(lines[1], b"two\r\n");
    }

    #[test]
    fn accept_times_out_without_peer() {
        let ex = Executor::new().unwrap();
        let server = Rc::new(TcpServerSock::listen(&loopback(), 16).unwrap());
        let timed_out = Rc::new(RefCell::new(false));
        let out = timed_out.clone();
        let srv = server.clone();
        ex.spawn_on(async move {
            match srv.accept(deadline_after(30)).await {
                Err(e) if e.is_timeout() => *out.borrow_mut() = true,
                _ => {}
            }
        });
        ex.run_until_complete();
        assert!(*timed_out.borrow());
    }
}
