//! The HTTP/1.1 pipeline: parser, routing trie, middleware chain,
//! request/response, static files and WebSocket upgrade.

pub mod connection;
pub mod cookie;
pub mod fserver;
pub mod middleware;
pub mod parser;
pub mod request;
pub mod response;
pub mod routing;
pub mod status;
pub mod wsock;

pub use connection::{HttpHandler, http_server};
pub use cookie::Cookie;
pub use fserver::{FileServer, FileServerConfig};
pub use middleware::{Middleware, MiddlewareChain};
pub use request::{HeaderMap, Request, UploadedFile};
pub use response::{Chunk, HandlerResult, HttpError, Response};
pub use routing::{Route, RouteAttrs, RouteParams, Router};
pub use status::{Method, Status};
pub use wsock::{WebSock, WebSockApi, WsOp};
