//! Thin wrappers over the libc calls the engine relies on. Everything
//! here is non-blocking; waiting happens in the task runtime, never in
//! the kernel.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::SuilResult;

/// Create a non-blocking listening TCP socket bound to `addr`.
///
/// The listener is shared by every worker; accept arbitration happens
/// through the supervisor's accept lock, so SO_REUSEPORT is not used.
/// TCP_NODELAY is set on the listener and inherited by accepted
/// sockets; TCP_DEFER_ACCEPT keeps idle handshakes out of the accept
/// queue until data arrives.
pub fn create_listen_socket(addr: &SocketAddr, backlog: i32) -> SuilResult<RawFd> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let defer_secs: c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &defer_secs as *const _ as *const c_void,
            mem::size_of_val(&defer_secs) as socklen_t,
        );

        if let Err(err) = bind_addr(fd, addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> SuilResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// Create a non-blocking TCP socket and start connecting it to `addr`.
/// Returns `(fd, true)` when the connect completed synchronously and
/// `(fd, false)` when it is in progress; the caller waits for fd
/// writability and checks [`socket_error`].
pub fn start_connect(addr: &SocketAddr) -> SuilResult<(RawFd, bool)> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let rc = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::connect(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::connect(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };

        if rc == 0 {
            return Ok((fd, true));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            Ok((fd, false))
        } else {
            libc::close(fd);
            Err(err.into())
        }
    }
}

/// Fetch and clear the pending error on a socket (used to resolve an
/// in-progress connect).
pub fn socket_error(fd: RawFd) -> SuilResult<i32> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    unsafe {
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(err)
}

/// Accept one pending connection. `Ok(None)` means the queue is empty.
pub fn accept_connection(listen_fd: RawFd) -> SuilResult<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            // TCP_NODELAY is inherited from the listener socket
            Ok(Some(fd))
        }
    }
}

/// Non-blocking read. `Ok(None)` means the fd would block; `Ok(Some(0))`
/// means the peer closed the connection.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> SuilResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Non-blocking write. `Ok(None)` means the fd would block right now.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> SuilResult<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Vectored write: multiple buffers in a single syscall (scatter-gather
/// I/O). At most 8 segments are submitted per call.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> SuilResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Zero-copy file-to-socket transfer. Advances `*offset` by the number
/// of bytes moved. `Ok(None)` means the socket would block.
pub fn sendfile_nonblocking(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: &mut i64,
    count: usize,
) -> SuilResult<Option<usize>> {
    unsafe {
        let res = libc::sendfile(out_fd, in_fd, offset as *mut libc::off_t, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Create a Unix pipe with both ends non-blocking. Returns
/// `(read_fd, write_fd)`.
pub fn create_pipe() -> SuilResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Monotonic clock in milliseconds; all runtime deadlines are absolute
/// values of this clock. -1 stands for "no deadline" throughout.
pub fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_ERR: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Level-triggered epoll instance; one per worker reactor. Waiters are
/// re-armed on every wait, so a still-readable fd completes the next
/// wait immediately.
pub struct Epoll {
    pub fd: RawFd,
}

impl Epoll {
    pub fn new() -> SuilResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: RawFd, token: u64, interests: u32) -> SuilResult<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: u32) -> SuilResult<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> SuilResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // The fd may already be closed and auto-removed.
                if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> SuilResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn pipe_round_trip() {
        let (rd, wr) = create_pipe().unwrap();
        assert_eq!(write_nonblocking(wr, b"ping").unwrap(), Some(4));
        let mut buf = [0u8; 8];
        assert_eq!(read_nonblocking(rd, &mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");
        // Drained pipe reports would-block, not EOF.
        assert_eq!(read_nonblocking(rd, &mut buf).unwrap(), None);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn epoll_observes_pipe_readability() {
        let (rd, wr) = create_pipe().unwrap();
        let ep = Epoll::new().unwrap();
        ep.add(rd, rd as u64, EV_IN).unwrap();

        let mut events = [epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        write_nonblocking(wr, b"x").unwrap();
        let n = ep.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!({ events[0].u64 }, rd as u64);
        assert!({ events[0].events } & EV_IN != 0);

        ep.delete(rd).unwrap();
        close_fd(rd);
        close_fd(wr);
    }
}
