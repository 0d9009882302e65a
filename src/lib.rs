// src/lib.rs
pub mod config;
pub mod error;
pub mod http;
pub mod lock;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod sock;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use config::{HttpConfig, RpcConfig, ServerConfig};
pub use error::{SuilError, SuilResult};
pub use http::{
    Cookie, HandlerResult, HttpError, Method, MiddlewareChain, Request, Response, Router, Status,
    http_server,
};
pub use server::{Server, ServerHandler};

/// The library version reported by `rpc_Version` and the default
/// `Server` header.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Initialize logging with sensible defaults; the `RUST_LOG`
/// environment variable controls the filter. Call once at startup.
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
