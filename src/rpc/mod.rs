//! RPC layer: a varint length-prefixed envelope shared by the
//! JSON-RPC 2.0 server/client and the compact binary variant.

pub mod jsonrpc;
pub mod suilrpc;
pub mod wire;

pub use jsonrpc::{JsonRpcClient, JsonRpcHandler, JsonRpcServer, JrpcRequest, JrpcResponse, RpcError};
pub use suilrpc::{SrpcMeta, SuilRpcClient, SuilRpcHandler, SuilRpcServer};
