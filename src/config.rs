use std::path::PathBuf;

use serde::Deserialize;

/// Server-wide knobs for the worker supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of worker threads. Defaults to the number of CPUs.
    pub nworkers: usize,
    /// Listen backlog handed to the kernel.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nworkers: num_cpus::get(),
            backlog: 1024,
        }
    }
}

/// HTTP pipeline configuration. Field defaults follow the shipped
/// server defaults; all sizes are bytes, all times are what the field
/// name says.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-call socket deadline (milliseconds) for header/body reads.
    pub connection_timeout: i64,
    /// Spill request bodies above `disk_offload_min` to disk.
    pub disk_offload: bool,
    /// Offload threshold in bytes.
    pub disk_offload_min: usize,
    /// Hard reject for request bodies above this size.
    pub max_body_len: usize,
    /// Maximum bytes handed to a single socket send call.
    pub send_chunk: usize,
    /// Value (seconds) advertised in the Keep-Alive response header.
    /// 0 disables keep-alive entirely.
    pub keep_alive_time: u64,
    /// Strict-Transport-Security max-age in seconds; 0 disables the header.
    pub hsts_enable: u64,
    /// Value of the Server response header.
    pub server_name: String,
    /// Directory request bodies are offloaded into.
    pub offload_path: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 5000,
            disk_offload: false,
            disk_offload_min: 2048,
            max_body_len: 35648,
            send_chunk: 35_648_000,
            keep_alive_time: 3600,
            hsts_enable: 3600,
            server_name: concat!("suil/", env!("CARGO_PKG_VERSION")).to_string(),
            offload_path: PathBuf::from("./.body"),
        }
    }
}

/// Configuration for the raw-TCP RPC servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-call socket deadline in milliseconds.
    pub connection_timeout: i64,
    /// Largest accepted RPC message payload.
    pub max_message_len: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 5000,
            max_message_len: 8 << 20,
        }
    }
}
