//! JSON-RPC 2.0 over the length-prefixed envelope on a raw TCP socket.
//! Single requests and batches; batch responses preserve request
//! order. The `rpc_` method prefix is reserved for framework
//! extensions.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::RpcConfig;
use crate::error::{SuilError, SuilResult};
use crate::rpc::wire::{recv_framed, send_framed};
use crate::server::{Server, ServerHandler};
use crate::sock::TcpSock;
use crate::worker::WorkerContext;

pub const JSON_RPC_VERSION: &str = "2.0";

pub const JRPC_PARSE_ERROR: i32 = -32700;
pub const JRPC_INVALID_REQUEST: i32 = -32600;
pub const JRPC_METHOD_NOT_FOUND: i32 = -32601;
pub const JRPC_INVALID_PARAMS: i32 = -32602;
pub const JRPC_INTERNAL_ERROR: i32 = -32603;
/// Application errors map into -32000..-32099.
pub const JRPC_API_ERROR: i32 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(JRPC_METHOD_NOT_FOUND, format!("method '{method}' does not exist"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(JRPC_INVALID_PARAMS, detail)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JrpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JrpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<i64>,
}

impl JrpcResponse {
    fn result(id: Option<i64>, value: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: Some(value),
            error: None,
            id,
        }
    }

    fn failure(id: Option<i64>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Service implementation: dispatch a method call.
pub trait JsonRpcHandler: Send + Sync + 'static {
    fn call(&self, method: &str, params: &Value, id: Option<i64>) -> Result<Value, RpcError>;
}

type ExtensionFn = Box<dyn Fn(&Value) -> Result<Value, RpcError> + Send + Sync>;

/// JSON-RPC connection protocol over the generic accept loop.
pub struct JsonRpcServer<H> {
    handler: H,
    config: RpcConfig,
    extensions: HashMap<String, ExtensionFn>,
}

impl<H: JsonRpcHandler> JsonRpcServer<H> {
    pub fn new(handler: H, config: RpcConfig) -> Self {
        let mut extensions: HashMap<String, ExtensionFn> = HashMap::new();
        extensions.insert(
            "rpc_Version".to_string(),
            Box::new(|_| Ok(Value::String(crate::version().to_string()))),
        );
        Self {
            handler,
            config,
            extensions,
        }
    }

    /// Register an additional `rpc_`-prefixed extension method.
    pub fn extension(
        mut self,
        name: &str,
        f: impl Fn(&Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    ) -> Self {
        debug_assert!(name.starts_with("rpc_"), "extension methods use the rpc_ prefix");
        self.extensions.insert(name.to_string(), Box::new(f));
        self
    }

    /// Bind a TCP server speaking this protocol.
    pub fn bind(self, addr: &str) -> Server<Self> {
        Server::bind(addr, self)
    }

    /// Handle one decoded request object.
    fn dispatch(&self, req: JrpcRequest) -> JrpcResponse {
        if req.jsonrpc != JSON_RPC_VERSION {
            return JrpcResponse::failure(
                req.id,
                RpcError::new(
                    JRPC_INVALID_REQUEST,
                    format!("unsupported JSON RPC version '{}'", req.jsonrpc),
                ),
            );
        }

        let params = req.params.unwrap_or(Value::Null);
        debug!(method = %req.method, id = ?req.id, "json-rpc dispatch");

        let outcome = if req.method.starts_with("rpc_") {
            match self.extensions.get(&req.method) {
                Some(ext) => ext(&params),
                None => Err(RpcError::method_not_found(&req.method)),
            }
        } else {
            self.handler.call(&req.method, &params, req.id)
        };

        match outcome {
            Ok(value) => JrpcResponse::result(req.id, value),
            Err(error) => JrpcResponse::failure(req.id, error),
        }
    }

    /// Handle a raw message: a single request object or a batch array.
    /// Batches answer with an array of the same length and order.
    pub fn handle_message(&self, raw: &[u8]) -> Vec<u8> {
        let parsed: Result<Value, _> = serde_json::from_slice(raw);
        let encoded = match parsed {
            Err(e) => serde_json::to_vec(&JrpcResponse::failure(
                None,
                RpcError {
                    code: JRPC_PARSE_ERROR,
                    message: "ParseError".to_string(),
                    data: Some(Value::String(e.to_string())),
                },
            )),
            Ok(Value::Array(entries)) => {
                let responses: Vec<JrpcResponse> = entries
                    .into_iter()
                    .map(|entry| self.dispatch_value(entry))
                    .collect();
                serde_json::to_vec(&responses)
            }
            Ok(single) => serde_json::to_vec(&self.dispatch_value(single)),
        };
        encoded.unwrap_or_else(|e| {
            error!("encoding json-rpc response failed: {e}");
            Vec::new()
        })
    }

    fn dispatch_value(&self, entry: Value) -> JrpcResponse {
        match serde_json::from_value::<JrpcRequest>(entry) {
            Ok(req) => self.dispatch(req),
            Err(e) => JrpcResponse::failure(
                None,
                RpcError {
                    code: JRPC_INVALID_REQUEST,
                    message: "InvalidRequest".to_string(),
                    data: Some(Value::String(e.to_string())),
                },
            ),
        }
    }
}

impl<H: JsonRpcHandler> ServerHandler for JsonRpcServer<H> {
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
                        debug!("json-rpc receive failed: {e}");
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

/// Client half: sequential call/response over one connection.
pub struct JsonRpcClient {
    sock: TcpSock,
    config: RpcConfig,
    next_id: i64,
}

impl JsonRpcClient {
    pub async fn connect(addr: std::net::SocketAddr, config: RpcConfig) -> SuilResult<Self> {
        let sock = TcpSock::connect(addr, crate::runtime::deadline_after(config.connection_timeout))
            .await?;
        Ok(Self {
            sock,
            config,
            next_id: 1,
        })
    }

    pub async fn call(&mut self, method: &str, params: Option<Value>) -> SuilResult<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JrpcRequest {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            method: method.to_string(),
            id: Some(id),
            params,
        };
        let raw = serde_json::to_vec(&req).map_err(|e| SuilError::proto(e.to_string()))?;
        send_framed(&mut self.sock, &raw, self.config.connection_timeout).await?;

        let reply = recv_framed(
            &mut self.sock,
            self.config.max_message_len,
            self.config.connection_timeout,
        )
        .await?
        .ok_or(SuilError::Closed)?;
        let resp: JrpcResponse =
            serde_json::from_slice(&reply).map_err(|e| SuilError::proto(e.to_string()))?;
        match (resp.result, resp.error) {
            (Some(result), None) => Ok(result),
            (None, Some(err)) => Err(SuilError::Other(format!(
                "rpc error {}: {}",
                err.code, err.message
            ))),
            _ => Err(SuilError::proto("response must set exactly one of result/error")),
        }
    }

    /// Issue a batch; the reply is one entry per request, in order.
    pub async fn batch(
        &mut self,
        calls: Vec<(String, Option<Value>)>,
    ) -> SuilResult<Vec<JrpcResponse>> {
        let requests: Vec<JrpcRequest> = calls
            .into_iter()
            .map(|(method, params)| {
                let id = self.next_id;
                self.next_id += 1;
                JrpcRequest {
                    jsonrpc: JSON_RPC_VERSION.to_string(),
                    method,
                    id: Some(id),
                    params,
                }
            })
            .collect();
        let raw = serde_json::to_vec(&requests).map_err(|e| SuilError::proto(e.to_string()))?;
        send_framed(&mut self.sock, &raw, self.config.connection_timeout).await?;

        let reply = recv_framed(
            &mut self.sock,
            self.config.max_message_len,
            self.config.connection_timeout,
        )
        .await?
        .ok_or(SuilError::Closed)?;
        serde_json::from_slice(&reply).map_err(|e| SuilError::proto(e.to_string()))
    }

    pub async fn rpc_version(&mut self) -> SuilResult<String> {
        match self.call("rpc_Version", None).await? {
            Value::String(v) => Ok(v),
            other => Err(SuilError::proto(format!("unexpected version payload {other}"))),
        }
    }
}
