//! The compact binary RPC variant. Methods carry dense integer ids
//! assigned at startup; method id 0 answers a meta record (version,
//! method table, extension table) clients use to build their name→id
//! maps. Extension ids are zero or negative, application ids positive.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RpcConfig;
use crate::error::{SuilError, SuilResult};
use crate::rpc::jsonrpc::{JRPC_INTERNAL_ERROR, JRPC_METHOD_NOT_FOUND, RpcError};
use crate::rpc::wire::{recv_framed, send_framed};
use crate::server::{Server, ServerHandler};
use crate::sock::TcpSock;
use crate::worker::WorkerContext;

/// Meta handshake method id.
pub const SRPC_META: i32 = 0;
/// Built-in extension returning the library version string.
pub const SRPC_VERSION: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct SrpcRequest {
    pub id: u32,
    pub method: i32,
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrpcResponse {
    pub id: u32,
    /// 0 means success; on failure `message`/`detail` describe it.
    pub code: i32,
    pub message: String,
    pub data: Vec<u8>,
}

/// The record answered for method id 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SrpcMeta {
    pub version: String,
    pub methods: Vec<(i32, String)>,
    pub extensions: Vec<(i32, String)>,
}

// ---- binary codec ----

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> SuilResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(SuilError::proto("truncated suilrpc message"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> SuilResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> SuilResult<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> SuilResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> SuilResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| SuilError::proto("invalid utf-8 string"))
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

impl SrpcRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.params.len());
        put_u32(&mut out, self.id);
        put_i32(&mut out, self.method);
        put_bytes(&mut out, &self.params);
        out
    }

    pub fn decode(raw: &[u8]) -> SuilResult<Self> {
        let mut r = Reader::new(raw);
        let req = Self {
            id: r.u32()?,
            method: r.i32()?,
            params: r.bytes()?.to_vec(),
        };
        if !r.done() {
            return Err(SuilError::proto("trailing bytes after suilrpc request"));
        }
        Ok(req)
    }
}

impl SrpcResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.message.len() + self.data.len());
        put_u32(&mut out, self.id);
        put_i32(&mut out, self.code);
        put_bytes(&mut out, self.message.as_bytes());
        put_bytes(&mut out, &self.data);
        out
    }

    pub fn decode(raw: &[u8]) -> SuilResult<Self> {
        let mut r = Reader::new(raw);
        Ok(Self {
            id: r.u32()?,
            code: r.i32()?,
            message: r.string()?,
            data: r.bytes()?.to_vec(),
        })
    }
}

impl SrpcMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_bytes(&mut out, self.version.as_bytes());
        for table in [&self.methods, &self.extensions] {
            put_u32(&mut out, table.len() as u32);
            for (id, name) in table {
                put_i32(&mut out, *id);
                put_bytes(&mut out, name.as_bytes());
            }
        }
        out
    }

    pub fn decode(raw: &[u8]) -> SuilResult<Self> {
        let mut r = Reader::new(raw);
        let version = r.string()?;
        let mut tables: [Vec<(i32, String)>; 2] = [Vec::new(), Vec::new()];
        for table in tables.iter_mut() {
            let count = r.u32()?;
            for _ in 0..count {
                let id = r.i32()?;
                let name = r.string()?;
                table.push((id, name));
            }
        }
        let [methods, extensions] = tables;
        Ok(Self {
            version,
            methods,
            extensions,
        })
    }
}

/// Service implementation. Method ids are assigned by the service and
/// must be positive and dense.
pub trait SuilRpcHandler: Send + Sync + 'static {
    fn methods(&self) -> Vec<(i32, String)>;
    fn call(&self, method: i32, params: &[u8], id: u32) -> Result<Vec<u8>, RpcError>;
}

pub struct SuilRpcServer<H> {
    handler: H,
    config: RpcConfig,
    meta: SrpcMeta,
}

impl<H: SuilRpcHandler> SuilRpcServer<H> {
    pub fn new(handler: H, config: RpcConfig) -> Self {
        let meta = SrpcMeta {
            version: crate::version().to_string(),
            methods: handler.methods(),
            extensions: vec![(SRPC_VERSION, "rpc_Version".to_string())],
        };
        Self {
            handler,
            config,
            meta,
        }
    }

    pub fn bind(self, addr: &str) -> Server<Self> {
        Server::bind(addr, self)
    }

    fn dispatch_extension(&self, method: i32) -> Result<Vec<u8>, RpcError> {
        match method {
            SRPC_META => Ok(self.meta.encode()),
            SRPC_VERSION => Ok(crate::version().as_bytes().to_vec()),
            other => Err(RpcError::new(
                JRPC_METHOD_NOT_FOUND,
                format!("extension method with id={other} does not exist"),
            )),
        }
    }

    /// Handle one raw request payload and encode the response.
    pub fn handle_message(&self, raw: &[u8]) -> Vec<u8> {
        let (id, outcome) = match SrpcRequest::decode(raw) {
            Ok(req) => {
                debug!(id = req.id, method = req.method, "suilrpc dispatch");
                let outcome = if req.method <= 0 {
                    self.dispatch_extension(req.method)
                } else {
                    self.handler.call(req.method, &req.params, req.id)
                };
                (req.id, outcome)
            }
            Err(e) => (
                0,
                Err(RpcError::new(JRPC_INTERNAL_ERROR, e.to_string())),
            ),
        };

        let resp = match outcome {
            Ok(data) => SrpcResponse {
                id,
                code: 0,
                message: String::new(),
                data,
            },
            Err(err) => SrpcResponse {
                id,
                code: err.code,
                message: err.message,
                data: Vec::new(),
            },
        };
        resp.encode()
    }
}

impl<H: SuilRpcHandler> ServerHandler for SuilRpcServer<H> {
    fn handle(
        self: Arc<Self>,
        mut sock: TcpSock,
        _ctx: WorkerContext,
    ) -> impl Future<Output = ()> + 'static {
        async move {
            loop {
                let raw = match recv_framed(
                    &mut sock,
                    self.config.max_message_len,
                    self.config.connection_timeout,
                )
                .await
                {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("suilrpc receive failed: {e}");
                        break;
                    }
                };

                let response = self.handle_message(&raw);
                if send_framed(&mut sock, &response, self.config.connection_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Client half. The connect handshake fetches the meta record and
/// builds the name→id map.
pub struct SuilRpcClient {
    sock: TcpSock,
    config: RpcConfig,
    next_id: u32,
    methods: HashMap<String, i32>,
    version: String,
}

impl SuilRpcClient {
    pub async fn connect(addr: std::net::SocketAddr, config: RpcConfig) -> SuilResult<Self> {
        let sock =
            TcpSock::connect(addr, crate::runtime::deadline_after(config.connection_timeout))
                .await?;
        let mut client = Self {
            sock,
            config,
            next_id: 1,
            methods: HashMap::new(),
            version: String::new(),
        };

        let data = client.call_id(SRPC_META, &[]).await?;
        let meta = SrpcMeta::decode(&data)?;
        for (id, name) in meta.methods.iter().chain(meta.extensions.iter()) {
            client.methods.insert(name.clone(), *id);
        }
        client.version = meta.version;
        Ok(client)
    }

    /// Server version reported in the handshake meta record.
    pub fn server_version(&self) -> &str {
        &self.version
    }

    pub async fn call(&mut self, method: &str, params: &[u8]) -> SuilResult<Vec<u8>> {
        let id = *self
            .methods
            .get(method)
            .ok_or_else(|| SuilError::Other(format!("unknown rpc method '{method}'")))?;
        self.call_id(id, params).await
    }

    pub async fn rpc_version(&mut self) -> SuilResult<String> {
        let raw = self.call_id(SRPC_VERSION, &[]).await?;
        String::from_utf8(raw).map_err(|_| SuilError::proto("version is not utf-8"))
    }

    async fn call_id(&mut self, method: i32, params: &[u8]) -> SuilResult<Vec<u8>> {
        let id = self.next_id;
        self.next_id += 1;
        let req = SrpcRequest {
            id,
            method,
            params: params.to_vec(),
        };
        send_framed(&mut self.sock, &req.encode(), self.config.connection_timeout).await?;

        let raw = recv_framed(
            &mut self.sock,
            self.config.max_message_len,
            self.config.connection_timeout,
        )
        .await?
        .ok_or(SuilError::Closed)?;
        let resp = SrpcResponse::decode(&raw)?;
        if resp.id != id {
            return Err(SuilError::proto(format!(
                "response id {} does not match request id {id}",
                resp.id
            )));
        }
        if resp.code != 0 {
            return Err(SuilError::Other(format!(
                "rpc error {}: {}",
                resp.code, resp.message
            )));
        }
        Ok(resp.data)
    }
}
