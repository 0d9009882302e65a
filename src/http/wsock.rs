//! RFC 6455 server-side WebSocket support: upgrade handshake, frame
//! codec, a per-worker registry of live connections and broadcast with
//! cross-worker fan-out over the supervisor's IPC pipes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use crate::error::{SuilError, SuilResult};
use crate::http::request::Request;
use crate::http::response::{HandlerResult, HttpError, Response};
use crate::runtime::{Channel, Either, FdInterest, deadline_after, fd_wait, select2, spawn};
use crate::sock::{SocketAdaptor, TcpSock};
use crate::worker::{WorkerContext, ipc_register};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PAYLOAD_SINGLE: usize = 125;
const PAYLOAD_EXTEND_1: usize = 126;
const PAYLOAD_EXTEND_2: usize = 127;
/// IPC frame tag for cross-worker WebSocket broadcast.
pub const IPC_WSOCK_BROADCAST: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsOp {
    Cont = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOp {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(WsOp::Cont),
            0x1 => Some(WsOp::Text),
            0x2 => Some(WsOp::Binary),
            0x8 => Some(WsOp::Close),
            0x9 => Some(WsOp::Ping),
            0xA => Some(WsOp::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, WsOp::Close | WsOp::Ping | WsOp::Pong)
    }
}

type ConnectFn = dyn Fn(&WebSock) -> bool + Send + Sync;
type MessageFn = dyn Fn(&WebSock, &[u8], WsOp) + Send + Sync;
type CloseFn = dyn Fn(&WebSock) + Send + Sync;
type DisconnectFn = dyn Fn() + Send + Sync;

static NEXT_API_ID: AtomicU8 = AtomicU8::new(0);

/// A named group of WebSocket endpoints sharing handlers, a timeout
/// and a broadcast domain.
pub struct WebSockApi {
    id: u8,
    timeout: i64,
    on_connect: Option<Box<ConnectFn>>,
    on_message: Option<Box<MessageFn>>,
    on_close: Option<Box<CloseFn>>,
    on_disconnect: Option<Box<DisconnectFn>>,
}

impl WebSockApi {
    pub fn builder() -> WebSockApiBuilder {
        WebSockApiBuilder {
            timeout: 10_000,
            on_connect: None,
            on_message: None,
            on_close: None,
            on_disconnect: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }
}

pub struct WebSockApiBuilder {
    timeout: i64,
    on_connect: Option<Box<ConnectFn>>,
    on_message: Option<Box<MessageFn>>,
    on_close: Option<Box<CloseFn>>,
    on_disconnect: Option<Box<DisconnectFn>>,
}

impl WebSockApiBuilder {
    /// Per-frame I/O deadline in milliseconds.
    pub fn timeout(mut self, ms: i64) -> Self {
        self.timeout = ms;
        self
    }

    /// Return false to reject the connection after the upgrade.
    pub fn on_connect(mut self, f: impl Fn(&WebSock) -> bool + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&WebSock, &[u8], WsOp) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&WebSock) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<WebSockApi> {
        Arc::new(WebSockApi {
            id: NEXT_API_ID.fetch_add(1, Ordering::Relaxed),
            timeout: self.timeout,
            on_connect: self.on_connect,
            on_message: self.on_message,
            on_close: self.on_close,
            on_disconnect: self.on_disconnect,
        })
    }
}

enum OutMsg {
    Frame { op: WsOp, data: Vec<u8> },
    Shutdown,
}

/// A live server-side WebSocket, handed to the API callbacks. Sends
/// are queued onto the connection's pump, so callbacks never block.
pub struct WebSock {
    id: u64,
    api_id: u8,
    out: Channel<OutMsg>,
    ctx: WorkerContext,
}

impl WebSock {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for this peer.
    pub fn send(&self, data: &[u8], op: WsOp) {
        if self
            .out
            .try_send(OutMsg::Frame {
                op,
                data: data.to_vec(),
            })
            .is_err()
        {
            warn!(conn = self.id, "outbound queue full, dropping frame");
        }
    }

    /// Fan a frame out to every peer of this API, on every worker.
    pub fn broadcast(&self, data: &[u8], op: WsOp) {
        broadcast(&self.ctx, self.api_id, Some(self.id), data, op);
    }

    /// Ask the pump to close this connection.
    pub fn close(&self) {
        let _ = self.out.try_send(OutMsg::Shutdown);
    }
}

thread_local! {
    // Per-worker registry: (api, connection) -> outbound queue.
    static REGISTRY: RefCell<HashMap<(u8, u64), Channel<OutMsg>>> =
        RefCell::new(HashMap::new());
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Number of live sockets this worker holds for an API.
pub fn local_peer_count(api: &WebSockApi) -> usize {
    REGISTRY.with(|r| r.borrow().keys().filter(|(a, _)| *a == api.id).count())
}

/// Compute the Sec-WebSocket-Accept token for a client key.
fn accept_token(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Validate the upgrade request and arm the protocol switch; after the
/// 101 is flushed the connection task hands the socket to the
/// WebSocket session.
pub fn handshake(req: &mut Request, resp: &mut Response, api: Arc<WebSockApi>) -> HandlerResult {
    let key = req
        .header("Sec-WebSocket-Key")
        .ok_or_else(|| HttpError::bad_request("missing Sec-WebSocket-Key"))?
        .to_string();

    match req.header("Sec-WebSocket-Version") {
        Some("13") => {}
        _ => {
            resp.header("Sec-WebSocket-Version", "13");
            return Err(HttpError::bad_request("unsupported websocket version"));
        }
    }

    let ctx = req
        .worker()
        .cloned()
        .ok_or_else(|| HttpError::internal("no worker context on request"))?;

    resp.header("Upgrade", "websocket");
    resp.header("Connection", "Upgrade");
    resp.header("Sec-WebSocket-Accept", accept_token(&key));
    resp.protocol_switch(Box::new(move |sock| Box::pin(session(sock, api, ctx))));
    Ok(())
}

/// Register the cross-worker broadcast dispatcher on this worker.
/// Called once per worker before serving.
pub fn register_ipc() {
    ipc_register(IPC_WSOCK_BROADCAST, |payload| {
        if payload.len() < 2 {
            return;
        }
        let api_id = payload[0];
        let Some(op) = WsOp::from_bits(payload[1]) else {
            return;
        };
        let data = payload[2..].to_vec();
        spawn(broadcast_local(api_id, None, data, op));
    });
}

fn broadcast(ctx: &WorkerContext, api_id: u8, src: Option<u64>, data: &[u8], op: WsOp) {
    trace!(api_id, len = data.len(), "websocket broadcast");
    let mut frame = Vec::with_capacity(2 + data.len());
    frame.push(api_id);
    frame.push(op as u8);
    frame.extend_from_slice(data);
    ctx.ipc_broadcast(IPC_WSOCK_BROADCAST, &frame);
    spawn(broadcast_local(api_id, src, data.to_vec(), op));
}

/// Deliver to every local peer: one sender task per peer, joined on a
/// countdown channel. A single peer skips the fan-out machinery.
async fn broadcast_local(api_id: u8, src: Option<u64>, data: Vec<u8>, op: WsOp) {
    let peers: Vec<Channel<OutMsg>> = REGISTRY.with(|r| {
        r.borrow()
            .iter()
            .filter(|((a, id), _)| *a == api_id && Some(*id) != src)
            .map(|(_, out)| out.clone())
            .collect()
    });

    if peers.is_empty() {
        return;
    }
    if peers.len() == 1 {
        let _ = peers[0]
            .send(OutMsg::Frame {
                op,
                data,
            })
            .await;
        return;
    }

    let done: Channel<()> = Channel::new(peers.len());
    let npeers = peers.len();
    for out in peers {
        let done = done.clone();
        let data = data.clone();
        spawn(async move {
            let _ = out.send(OutMsg::Frame { op, data }).await;
            let _ = done.send(()).await;
        });
    }
    let completions = done.recv_n(npeers, deadline_after(5000)).await;
    trace!(api_id, npeers, delivered = completions.len(), "broadcast done");
}

async fn session(mut sock: TcpSock, api: Arc<WebSockApi>, ctx: WorkerContext) {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let out: Channel<OutMsg> = Channel::new(1024);
    let ws = WebSock {
        id,
        api_id: api.id,
        out: out.clone(),
        ctx,
    };

    REGISTRY.with(|r| r.borrow_mut().insert((api.id, id), out.clone()));
    debug!(conn = id, api = api.id, "websocket session started");

    if let Some(on_connect) = &api.on_connect {
        if !on_connect(&ws) {
            REGISTRY.with(|r| r.borrow_mut().remove(&(api.id, id)));
            return;
        }
    }

    loop {
        // Bytes pushed back by the protocol switch are served before
        // waiting on the fd again.
        if sock.has_buffered() {
            if !handle_client_frame(&mut sock, &api, &ws).await {
                break;
            }
            continue;
        }

        match select2(fd_wait(sock.fd(), FdInterest::Read, -1), out.recv(-1)).await {
            Either::Left(Ok(ev)) => {
                if ev.error() && !ev.readable() {
                    break;
                }
                if !handle_client_frame(&mut sock, &api, &ws).await {
                    break;
                }
            }
            Either::Left(Err(_)) => break,
            Either::Right(Ok(OutMsg::Frame { op, data })) => {
                if write_frame(&mut sock, op, &data, api.timeout).await.is_err() {
                    break;
                }
            }
            Either::Right(Ok(OutMsg::Shutdown)) => {
                // Server-initiated close: 1000 Normal Closure.
                let _ = write_frame(&mut sock, WsOp::Close, &1000u16.to_be_bytes(), api.timeout)
                    .await;
                if let Some(on_close) = &api.on_close {
                    on_close(&ws);
                }
                break;
            }
            Either::Right(Err(_)) => break,
        }
    }

    REGISTRY.with(|r| r.borrow_mut().remove(&(api.id, id)));
    out.close();
    if let Some(on_disconnect) = &api.on_disconnect {
        on_disconnect();
    }
    debug!(conn = id, "websocket session ended");
}

/// Read and dispatch one client frame. Returns false when the session
/// must end.
async fn handle_client_frame(sock: &mut TcpSock, api: &WebSockApi, ws: &WebSock) -> bool {
    match recv_frame(sock, api.timeout).await {
        Ok((op, payload)) => match op {
            WsOp::Text | WsOp::Binary => {
                if let Some(on_message) = &api.on_message {
                    on_message(ws, &payload, op);
                }
                true
            }
            WsOp::Ping => write_frame(sock, WsOp::Pong, &payload, api.timeout)
                .await
                .is_ok(),
            WsOp::Pong => true,
            WsOp::Close => {
                let _ = write_frame(sock, WsOp::Close, &payload, api.timeout).await;
                if let Some(on_close) = &api.on_close {
                    on_close(ws);
                }
                false
            }
            // No cross-frame reassembly: a continuation frame
            // terminates the connection.
            WsOp::Cont => false,
        },
        Err(e) => {
            trace!(conn = ws.id, "websocket receive failed: {e}");
            false
        }
    }
}

/// Read one client frame, unmasking the payload in place.
async fn recv_frame(sock: &mut TcpSock, timeout: i64) -> SuilResult<(WsOp, Vec<u8>)> {
    let deadline = deadline_after(timeout);
    let mut hdr = [0u8; 2];
    sock.recv_exact(&mut hdr, deadline).await?;

    let fin = hdr[0] & 0x80 != 0;
    if hdr[0] & 0x70 != 0 {
        return Err(SuilError::proto("websocket frame has RSV bits set"));
    }
    let op = WsOp::from_bits(hdr[0] & 0x0F)
        .ok_or_else(|| SuilError::proto("unrecognised websocket opcode"))?;
    let masked = hdr[1] & 0x80 != 0;
    if !masked {
        // Client frames are always masked.
        return Err(SuilError::proto("client frame is not masked"));
    }

    let len7 = (hdr[1] & 0x7F) as usize;
    let len = match len7 {
        PAYLOAD_EXTEND_1 => {
            let mut ext = [0u8; 2];
            sock.recv_exact(&mut ext, deadline).await?;
            u16::from_be_bytes(ext) as usize
        }
        PAYLOAD_EXTEND_2 => {
            let mut ext = [0u8; 8];
            sock.recv_exact(&mut ext, deadline).await?;
            u64::from_be_bytes(ext) as usize
        }
        n => n,
    };

    if op.is_control() && (len > PAYLOAD_SINGLE || !fin) {
        return Err(SuilError::proto("oversized or fragmented control frame"));
    }

    let mut mask = [0u8; 4];
    sock.recv_exact(&mut mask, deadline).await?;

    let mut payload = vec![0u8; len];
    sock.recv_exact(&mut payload, deadline).await?;
    apply_mask(&mut payload, mask);
    Ok((op, payload))
}

/// Send one unmasked server frame: header (at most 10 bytes), payload,
/// flush.
async fn write_frame(sock: &mut TcpSock, op: WsOp, data: &[u8], timeout: i64) -> SuilResult<()> {
    let deadline = deadline_after(timeout);
    let (hdr, hdr_len) = encode_frame_header(op, data.len());
    sock.send(&hdr[..hdr_len], deadline).await?;
    sock.send(data, deadline).await?;
    sock.flush(deadline).await
}

fn encode_frame_header(op: WsOp, len: usize) -> ([u8; 10], usize) {
    let mut hdr = [0u8; 10];
    hdr[0] = 0x80 | op as u8; // fin, no rsv
    if len <= PAYLOAD_SINGLE {
        hdr[1] = len as u8;
        (hdr, 2)
    } else if len <= u16::MAX as usize {
        hdr[1] = PAYLOAD_EXTEND_1 as u8;
        hdr[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        (hdr, 4)
    } else {
        hdr[1] = PAYLOAD_EXTEND_2 as u8;
        hdr[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        (hdr, 10)
    }
}

fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_token_matches_rfc_vector() {
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn header_encoding_by_length() {
        let (hdr, n) = encode_frame_header(WsOp::Text, 5);
        assert_eq!(n, 2);
        assert_eq!(hdr[0], 0x81);
        assert_eq!(hdr[1], 5);

        let (hdr, n) = encode_frame_header(WsOp::Binary, 300);
        assert_eq!(n, 4);
        assert_eq!(hdr[1], 126);
        assert_eq!(u16::from_be_bytes([hdr[2], hdr[3]]), 300);

        let (hdr, n) = encode_frame_header(WsOp::Binary, 70_000);
        assert_eq!(n, 10);
        assert_eq!(hdr[1], 127);
        assert_eq!(u64::from_be_bytes(hdr[2..10].try_into().unwrap()), 70_000);
    }

    #[test]
    fn masking_round_trips() {
        let mask = [0xA1, 0x5C, 0x33, 0x07];
        let original = b"masked payload bytes".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn opcode_decode_rejects_reserved() {
        assert_eq!(WsOp::from_bits(0x1), Some(WsOp::Text));
        assert_eq!(WsOp::from_bits(0x3), None);
        assert_eq!(WsOp::from_bits(0xB), None);
        assert!(WsOp::Close.is_control());
        assert!(!WsOp::Text.is_control());
    }
}
