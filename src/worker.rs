//! Worker supervisor. Spawns N workers, pins each to a CPU, shares the
//! listening socket behind the accept lock and wires per-worker pipes
//! for cross-worker broadcast. Each worker gets a `WorkerContext`
//! instead of reading process globals.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{SuilError, SuilResult};
use crate::lock::LockPool;
use crate::runtime::{Executor, FdInterest, fd_wait};
use crate::syscalls;

/// One entry per worker in the shared table.
pub struct WorkerRecord {
    pub wid: usize,
    pub cpu: usize,
    pub active: AtomicBool,
    pipe_rd: RawFd,
    pipe_wr: RawFd,
}

/// Everything a worker needs from the supervisor, handed to it on
/// start.
#[derive(Clone)]
pub struct WorkerContext {
    pub wid: usize,
    pub cpu: usize,
    records: Arc<Vec<WorkerRecord>>,
    locks: Arc<LockPool>,
}

impl WorkerContext {
    pub fn nworkers(&self) -> usize {
        self.records.len()
    }

    pub fn locks(&self) -> &LockPool {
        &self.locks
    }

    pub(crate) fn pipe_rd(&self) -> RawFd {
        self.records[self.wid].pipe_rd
    }

    /// Best-effort framed broadcast to every *other* active worker.
    /// No ack, no retry: a full pipe drops the message.
    pub fn ipc_broadcast(&self, tag: u8, payload: &[u8]) {
        for rec in self.records.iter() {
            if rec.wid == self.wid || !rec.active.load(Ordering::Acquire) {
                continue;
            }
            self.ipc_send_to(rec, tag, payload);
        }
    }

    fn ipc_send_to(&self, rec: &WorkerRecord, tag: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        match syscalls::write_nonblocking(rec.pipe_wr, &frame) {
            Ok(Some(n)) if n == frame.len() => {}
            Ok(_) => warn!(
                to = rec.wid,
                tag, "ipc pipe full, dropping broadcast frame"
            ),
            Err(e) => warn!(to = rec.wid, tag, "ipc write failed: {e}"),
        }
    }
}

thread_local! {
    static IPC_HANDLERS: RefCell<HashMap<u8, Box<dyn Fn(&[u8])>>> =
        RefCell::new(HashMap::new());
}

/// Register this worker's handler for an IPC frame tag. Handlers are
/// worker-local; every worker registers its own during setup.
pub fn ipc_register(tag: u8, handler: impl Fn(&[u8]) + 'static) {
    IPC_HANDLERS.with(|h| h.borrow_mut().insert(tag, Box::new(handler)));
}

/// Pump this worker's pipe read-end and dispatch complete frames.
/// Spawned once per worker by the server setup.
pub async fn ipc_receive_task(ctx: WorkerContext) {
    let fd = ctx.pipe_rd();
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match syscalls::read_nonblocking(fd, &mut chunk) {
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                acc.extend_from_slice(&chunk[..n]);
                dispatch_frames(&mut acc, ctx.wid);
            }
            Ok(None) => match fd_wait(fd, FdInterest::Read, -1).await {
                Ok(ev) if ev.error() && !ev.readable() => break,
                Ok(_) => {}
                Err(_) => break,
            },
            Err(e) => {
                debug!(wid = ctx.wid, "ipc pipe read failed: {e}");
                break;
            }
        }
    }
}

fn dispatch_frames(acc: &mut Vec<u8>, wid: usize) {
    loop {
        if acc.len() < 5 {
            return;
        }
        let tag = acc[0];
        let len = u32::from_be_bytes([acc[1], acc[2], acc[3], acc[4]]) as usize;
        if acc.len() < 5 + len {
            return;
        }
        let payload: Vec<u8> = acc[5..5 + len].to_vec();
        acc.drain(..5 + len);
        IPC_HANDLERS.with(|h| {
            if let Some(handler) = h.borrow().get(&tag) {
                handler(&payload);
            } else {
                debug!(wid, tag, "no ipc handler registered, dropping frame");
            }
        });
    }
}

/// Forks out the worker threads and babysits them until shutdown.
pub struct Supervisor {
    records: Arc<Vec<WorkerRecord>>,
    locks: Arc<LockPool>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> SuilResult<Self> {
        let ncpus = num_cpus::get();
        let count = config.nworkers.max(1);
        if count > ncpus {
            warn!("number of workers ({count}) exceeds number of CPUs ({ncpus})");
        }

        let mut records = Vec::with_capacity(count);
        for wid in 0..count {
            let (pipe_rd, pipe_wr) = syscalls::create_pipe().map_err(|e| {
                SuilError::Worker(format!("creating worker/{wid} ipc pipe failed: {e}"))
            })?;
            records.push(WorkerRecord {
                wid,
                cpu: wid % ncpus,
                active: AtomicBool::new(false),
                pipe_rd,
                pipe_wr,
            });
        }

        Ok(Self {
            records: Arc::new(records),
            locks: LockPool::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn locks(&self) -> Arc<LockPool> {
        self.locks.clone()
    }

    /// Route SIGINT/SIGTERM to the shutdown flag. Only the first server
    /// in a process can install the process-wide handler; later calls
    /// keep their explicit `shutdown_flag` control.
    pub fn install_signal_handler(&self) {
        let shutdown = self.shutdown.clone();
        let locks = self.locks.clone();
        if ctrlc::set_handler(move || {
            info!("received termination signal, draining workers");
            shutdown.store(true, Ordering::Release);
            locks.shutdown_all();
        })
        .is_err()
        {
            debug!("signal handler already installed for this process");
        }
    }

    /// Spawn the workers and block until they all exit. `setup` runs on
    /// each worker thread with its executor installed; it spawns the
    /// worker's initial tasks (accept loop, IPC pump).
    pub fn run(&self, setup: Arc<dyn Fn(&WorkerContext) + Send + Sync>) -> SuilResult<()> {
        let mut handles = Vec::with_capacity(self.records.len());
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        // All records go active before any worker runs, so early
        // broadcasts see the full peer set.
        for rec in self.records.iter() {
            rec.active.store(true, Ordering::Release);
        }

        for rec in self.records.iter() {
            let wid = rec.wid;
            let core_id = core_ids.get(rec.cpu % core_ids.len().max(1)).copied();
            let ctx = WorkerContext {
                wid,
                cpu: rec.cpu,
                records: self.records.clone(),
                locks: self.locks.clone(),
            };
            let shutdown = self.shutdown.clone();
            let setup = setup.clone();

            let handle = thread::Builder::new()
                .name(format!("worker/{wid}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    let ex = match Executor::new() {
                        Ok(ex) => ex,
                        Err(e) => {
                            error!("worker/{wid} failed to create executor: {e}");
                            return;
                        }
                    };
                    debug!("worker/{wid} entering scheduler loop on cpu {:?}", core_id);
                    ex.enter(|| setup(&ctx));
                    ex.run_while(|| !shutdown.load(Ordering::Acquire));
                    debug!("worker/{wid} exiting");
                })
                .map_err(|e| SuilError::Worker(format!("spawning worker/{wid} failed: {e}")))?;
            handles.push((wid, handle));
        }

        let mut failed = 0;
        for (wid, handle) in handles {
            if handle.join().is_err() {
                error!("worker/{wid} panicked");
                failed += 1;
            }
            self.records[wid].active.store(false, Ordering::Release);
        }

        if failed > 0 {
            return Err(SuilError::Worker(format!("{failed} worker(s) panicked")));
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for rec in self.records.iter() {
            syscalls::close_fd(rec.pipe_rd);
            syscalls::close_fd(rec.pipe_wr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn workers_run_and_drain_on_shutdown() {
        let sup = Supervisor::new(ServerConfig {
            nworkers: 2,
            ..Default::default()
        })
        .unwrap();
        let shutdown = sup.shutdown_flag();
        let started = Arc::new(AtomicUsize::new(0));

        let started2 = started.clone();
        let shutdown2 = shutdown.clone();
        let setup: Arc<dyn Fn(&WorkerContext) + Send + Sync> = Arc::new(move |_ctx| {
            let started = started2.clone();
            let shutdown = shutdown2.clone();
            crate::runtime::spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                crate::runtime::sleep(20).await;
                // Last worker to arrive flips the flag for everyone.
                if started.load(Ordering::SeqCst) == 2 {
                    shutdown.store(true, Ordering::Release);
                }
            });
        });

        sup.run(setup).unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ipc_broadcast_reaches_peer_worker() {
        let sup = Supervisor::new(ServerConfig {
            nworkers: 2,
            ..Default::default()
        })
        .unwrap();
        let shutdown = sup.shutdown_flag();
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

        let received2 = received.clone();
        let shutdown2 = shutdown.clone();
        let setup: Arc<dyn Fn(&WorkerContext) + Send + Sync> = Arc::new(move |ctx| {
            let received = received2.clone();
            let shutdown = shutdown2.clone();
            let ctx = ctx.clone();

            ipc_register(7, move |payload| {
                received.lock().unwrap().push(payload.to_vec());
            });
            crate::runtime::spawn(ipc_receive_task(ctx.clone()));
            crate::runtime::spawn(async move {
                if ctx.wid == 0 {
                    ctx.ipc_broadcast(7, b"fan-out");
                }
                crate::runtime::sleep(60).await;
                shutdown.store(true, Ordering::Release);
            });
        });

        sup.run(setup).unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], b"fan-out");
    }
}
