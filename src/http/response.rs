//! HTTP response: status, headers, cookie jar and the body: either a
//! single inline buffer or an ordered list of chunks, where a chunk is
//! bytes or a (file, offset, length) triple destined for sendfile.

use std::fs::File;
use std::pin::Pin;

use serde::Serialize;

use crate::http::cookie::Cookie;
use crate::http::request::HeaderMap;
use crate::http::status::Status;
use crate::sock::TcpSock;

/// Handler-level failure: mapped by the connection loop onto an error
/// response, after which the connection is closed.
#[derive(Debug)]
pub struct HttpError {
    pub status: Status,
    pub message: String,
}

impl HttpError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Status::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Status::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::InternalError, message)
    }
}

pub type HandlerResult = Result<(), HttpError>;

/// A body segment. Buffer chunks carry their own storage; file chunks
/// keep the file open until transmission.
pub enum Chunk {
    Buf {
        data: Vec<u8>,
        off: usize,
        len: usize,
    },
    File {
        file: File,
        off: u64,
        len: usize,
    },
}

impl Chunk {
    pub fn bytes(data: Vec<u8>) -> Self {
        let len = data.len();
        Chunk::Buf { data, off: 0, len }
    }

    pub fn file(file: File, off: u64, len: usize) -> Self {
        Chunk::File { file, off, len }
    }

    pub fn len(&self) -> usize {
        match self {
            Chunk::Buf { len, .. } | Chunk::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection takeover installed by a protocol switch (WebSocket); runs
/// after the 101 response is flushed.
pub type ProtocolHandler = Box<dyn FnOnce(TcpSock) -> Pin<Box<dyn Future<Output = ()>>>>;

pub struct Response {
    pub status: Status,
    pub headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: Vec<u8>,
    chunks: Vec<Chunk>,
    completed: bool,
    close_connection: bool,
    proto: Option<ProtocolHandler>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: Status::Ok,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            chunks: Vec::new(),
            completed: false,
            close_connection: false,
            proto: None,
        }
    }

    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.set(name, value);
        self
    }

    pub fn cookie(&mut self, cookie: Cookie) -> &mut Self {
        self.cookies.push(cookie);
        self
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Append to the inline body. A response carries an inline body or
    /// a chunk list, never both.
    pub fn append(&mut self, data: &[u8]) -> &mut Self {
        debug_assert!(
            self.chunks.is_empty(),
            "response already carries explicit chunks"
        );
        self.body.extend_from_slice(data);
        self
    }

    /// Push an explicit body chunk.
    pub fn chunk(&mut self, chunk: Chunk) -> &mut Self {
        debug_assert!(
            self.body.is_empty(),
            "response already carries an inline body"
        );
        self.chunks.push(chunk);
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_vec(value) {
            Ok(data) => {
                self.headers.set("Content-Type", "application/json");
                self.append(&data);
            }
            Err(_) => {
                self.error(Status::InternalError, "serializing response failed");
            }
        }
        self
    }

    /// Mark the response complete with the given status. Middleware
    /// short-circuits on completed responses.
    pub fn end(&mut self, status: Status) {
        self.status = status;
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn redirect(&mut self, status: Status, location: &str) {
        self.headers.set("Location", location);
        self.end(status);
    }

    /// Rewrite this response as an error answer, discarding any body
    /// accumulated so far. The body a handler set before failing is
    /// kept only when `message` is empty.
    pub fn error(&mut self, status: Status, message: &str) {
        self.chunks.clear();
        if !message.is_empty() {
            self.body.clear();
            self.body.extend_from_slice(message.as_bytes());
        } else if self.body.is_empty() {
            self.body.extend_from_slice(status.phrase().as_bytes());
        }
        if status == Status::Unauthorized && !self.headers.contains("WWW-Authenticate") {
            self.headers.set("WWW-Authenticate", "Basic");
        }
        self.close_connection = true;
        self.end(status);
    }

    pub fn content_length(&self) -> usize {
        if self.chunks.is_empty() {
            self.body.len()
        } else {
            self.chunks.iter().map(Chunk::len).sum()
        }
    }

    pub fn inline_body(&self) -> &[u8] {
        &self.body
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn take_chunks(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }

    pub fn request_close(&mut self) {
        self.close_connection = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_connection
    }

    /// Install a protocol switch to run after the response is flushed.
    pub fn protocol_switch(&mut self, handler: ProtocolHandler) {
        self.proto = Some(handler);
        self.end(Status::SwitchingProtocols);
    }

    pub fn is_protocol_switch(&self) -> bool {
        self.proto.is_some()
    }

    pub fn take_protocol_handler(&mut self) -> Option<ProtocolHandler> {
        self.proto.take()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_body_accumulates() {
        let mut resp = Response::new();
        resp.append(b"Hello ").append(b"World");
        resp.end(Status::Ok);
        assert_eq!(resp.inline_body(), b"Hello World");
        assert_eq!(resp.content_length(), 11);
        assert!(resp.is_completed());
    }

    #[test]
    fn chunk_lengths_sum() {
        let mut resp = Response::new();
        resp.chunk(Chunk::bytes(vec![0; 10]));
        resp.chunk(Chunk::bytes(vec![1; 20]));
        resp.end(Status::Ok);
        assert_eq!(resp.content_length(), 30);
        assert_eq!(resp.chunks().len(), 2);
    }

    #[test]
    fn error_rewrites_body_and_forces_close() {
        let mut resp = Response::new();
        resp.append(b"partial work");
        resp.error(Status::InternalError, "handler exploded");
        assert_eq!(resp.inline_body(), b"handler exploded");
        assert!(resp.close_requested());
        assert_eq!(resp.status, Status::InternalError);
    }

    #[test]
    fn error_without_message_uses_phrase() {
        let mut resp = Response::new();
        resp.error(Status::NotFound, "");
        assert_eq!(resp.inline_body(), b"Not Found");
    }

    #[test]
    fn unauthorized_emits_www_authenticate() {
        let mut resp = Response::new();
        resp.error(Status::Unauthorized, "");
        assert!(resp.headers.contains("WWW-Authenticate"));
    }

    #[test]
    fn json_sets_content_type() {
        let mut resp = Response::new();
        resp.json(&serde_json::json!({"ok": true}));
        assert_eq!(resp.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(resp.inline_body(), br#"{"ok":true}"#);
    }
}
