//! Generic accept machinery. A `Server` pairs a listening address with
//! a connection handler; the same loop carries HTTP, JSON-RPC and
//! SuilRPC connections. Each worker's accept task serializes on the
//! pool's accept lock, so only one worker sits in accept at a time.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{SuilError, SuilResult};
use crate::runtime::{deadline_after, sleep, spawn};
use crate::sock::{TcpServerSock, TcpSock};
use crate::worker::{Supervisor, WorkerContext, ipc_receive_task};

/// A connection-level protocol served on top of the accept loop.
pub trait ServerHandler: Send + Sync + 'static {
    /// Drive one connection to completion. Runs as its own task on the
    /// worker that accepted the socket.
    fn handle(
        self: Arc<Self>,
        sock: TcpSock,
        ctx: WorkerContext,
    ) -> impl Future<Output = ()> + 'static;

    /// Per-worker setup hook, run once on each worker thread before it
    /// starts accepting (e.g. registering IPC dispatchers).
    fn worker_init(&self, ctx: &WorkerContext) {
        let _ = ctx;
    }
}

pub struct Server<H> {
    addr: String,
    config: ServerConfig,
    accept_timeout: i64,
    handler: Arc<H>,
}

impl<H: ServerHandler> Server<H> {
    pub fn bind(addr: &str, handler: H) -> Self {
        Self {
            addr: addr.to_string(),
            config: ServerConfig::default(),
            accept_timeout: 3000,
            handler: Arc::new(handler),
        }
    }

    pub fn workers(mut self, nworkers: usize) -> Self {
        self.config.nworkers = nworkers;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Deadline handed to each accept call, in milliseconds. The HTTP
    /// server sets this to half the keep-alive time.
    pub fn accept_timeout(mut self, ms: i64) -> Self {
        self.accept_timeout = ms.max(1);
        self
    }

    /// Bind the listening socket without starting workers; lets the
    /// caller learn an ephemeral port and keep the shutdown flag.
    pub fn into_bound(self) -> SuilResult<BoundServer<H>> {
        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(|e| SuilError::Other(format!("resolving {} failed: {e}", self.addr)))?
            .next()
            .ok_or_else(|| SuilError::Other(format!("{} resolves to nothing", self.addr)))?;
        let listener = TcpServerSock::listen(&addr, self.config.backlog)?;
        let supervisor = Supervisor::new(self.config)?;
        Ok(BoundServer {
            listener,
            supervisor,
            accept_timeout: self.accept_timeout,
            handler: self.handler,
        })
    }

    /// Bind, install the signal handler and serve until shutdown.
    pub fn serve(self) -> SuilResult<()> {
        let bound = self.into_bound()?;
        bound.supervisor.install_signal_handler();
        bound.run()
    }
}

pub struct BoundServer<H> {
    listener: TcpServerSock,
    supervisor: Supervisor,
    accept_timeout: i64,
    handler: Arc<H>,
}

impl<H: ServerHandler> BoundServer<H> {
    pub fn local_addr(&self) -> SuilResult<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.supervisor.shutdown_flag()
    }

    /// Run the workers until the shutdown flag flips.
    pub fn run(self) -> SuilResult<()> {
        let listen_fd = self.listener.fd();
        let accept_timeout = self.accept_timeout;
        let handler = self.handler.clone();
        let shutdown = self.supervisor.shutdown_flag();

        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "serving"
        );

        let setup: Arc<dyn Fn(&WorkerContext) + Send + Sync> = Arc::new(move |ctx| {
            handler.worker_init(ctx);
            spawn(ipc_receive_task(ctx.clone()));
            spawn(accept_loop(
                listen_fd,
                accept_timeout,
                handler.clone(),
                ctx.clone(),
                shutdown.clone(),
            ));
        });

        self.supervisor.run(setup)
    }
}

async fn accept_loop<H: ServerHandler>(
    listen_fd: i32,
    accept_timeout: i64,
    handler: Arc<H>,
    ctx: WorkerContext,
    shutdown: Arc<AtomicBool>,
) {
    let listener = TcpServerSock::from_shared(listen_fd);
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !ctx.locks().accept().acquire().await {
            break;
        }
        let res = listener.accept(deadline_after(accept_timeout)).await;
        ctx.locks().accept().release();

        match res {
            Ok(sock) => {
                debug!(wid = ctx.wid, fd = sock.fd(), "accepted connection");
                spawn(handler.clone().handle(sock, ctx.clone()));
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(wid = ctx.wid, "accept failed: {e}");
                sleep(50).await;
            }
        }
    }
}
