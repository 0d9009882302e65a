//! Per-connection HTTP state machine: receive a request, route it,
//! run the middleware chain and handler, serialize the response, then
//! loop for keep-alive or hand the socket to a protocol switch.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, trace};

use crate::config::HttpConfig;
use crate::error::SuilResult;
use crate::http::middleware::MiddlewareChain;
use crate::http::parser::Parser;
use crate::http::request::{Request, RequestBuilder};
use crate::http::response::{Chunk, Response};
use crate::http::routing::{Resolution, Router};
use crate::http::status::{Method, Status};
use crate::runtime::deadline_after;
use crate::server::{Server, ServerHandler};
use crate::sock::{SocketAdaptor, TcpSock};
use crate::worker::WorkerContext;

/// The HTTP protocol served over the generic accept loop.
pub struct HttpHandler {
    router: Router,
    config: HttpConfig,
    middlewares: MiddlewareChain,
}

impl HttpHandler {
    pub fn new(mut router: Router, config: HttpConfig, middlewares: MiddlewareChain) -> Self {
        router.freeze();
        Self {
            router,
            config,
            middlewares,
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl ServerHandler for HttpHandler {
    fn handle(
        self: Arc<Self>,
        sock: TcpSock,
        ctx: WorkerContext,
    ) -> impl Future<Output = ()> + 'static {
        connection_task(self, sock, ctx)
    }

    fn worker_init(&self, _ctx: &WorkerContext) {
        crate::http::wsock::register_ipc();
    }
}

/// Build an HTTP server: router + config + middleware over the worker
/// supervisor. Accept deadline is half the keep-alive time.
pub fn http_server(
    addr: &str,
    router: Router,
    config: HttpConfig,
    middlewares: MiddlewareChain,
) -> Server<HttpHandler> {
    let accept_timeout = (config.keep_alive_time as i64 * 1000 / 2).max(500);
    Server::bind(addr, HttpHandler::new(router, config, middlewares))
        .accept_timeout(accept_timeout)
}

enum RecvOutcome {
    Complete,
    /// Peer went away between requests; nothing to answer.
    Closed,
    Fail(Status),
}

async fn connection_task(handler: Arc<HttpHandler>, mut sock: TcpSock, ctx: WorkerContext) {
    let config = &handler.config;
    // Bytes received past a message boundary, kept for the next
    // request on the same connection.
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let mut parser = Parser::new();
        let mut req = Request::new();
        let mut resp = Response::new();
        let mut force_close = false;

        match receive_request(&mut sock, &mut parser, &mut req, config, &mut carry).await {
            RecvOutcome::Complete => {}
            RecvOutcome::Closed => break,
            RecvOutcome::Fail(status) => {
                resp.error(status, "");
                let _ = send_response(&mut sock, &req, &mut resp, config).await;
                break;
            }
        }

        trace!(
            wid = ctx.wid,
            method = req.method.as_str(),
            path = req.path(),
            "dispatching request"
        );

        req.set_worker(ctx.clone());
        let resolution = handler.router.resolve(req.method, req.path());

        req.install_contexts(handler.middlewares.make_contexts());
        let (entered, mut result) = handler.middlewares.run_before(&mut req, &mut resp);

        if result.is_ok() && !resp.is_completed() {
            match resolution {
                Resolution::Found { route, params } => {
                    req.params = params;
                    if route.attrs.parse_form && req.parse_form().is_err() {
                        resp.error(Status::BadRequest, "malformed form body");
                    } else {
                        if let Some(reply_type) = &route.attrs.reply_type {
                            if !resp.headers.contains("Content-Type") {
                                resp.header("Content-Type", reply_type.clone());
                            }
                        }
                        result = (route.handler())(&mut req, &mut resp);
                    }
                }
                Resolution::RedirectSlash => {
                    let location = format!("{}/", req.path());
                    resp.redirect(Status::MovedPermanently, &location);
                }
                Resolution::MethodNotAllowed => resp.error(Status::MethodNotAllowed, ""),
                Resolution::NotFound => resp.error(Status::NotFound, ""),
            }
        }

        handler.middlewares.run_after(entered, &mut req, &mut resp);
        req.drop_contexts();

        if let Err(e) = result {
            debug!(status = e.status.code(), "handler failed: {}", e.message);
            resp.error(e.status, &e.message);
            force_close = true;
        }

        let keep_alive = match send_response(&mut sock, &req, &mut resp, config).await {
            Ok(keep_alive) => keep_alive && !force_close,
            Err(e) => {
                debug!("sending response failed: {e}");
                break;
            }
        };

        if resp.is_protocol_switch() {
            if let Some(proto) = resp.take_protocol_handler() {
                // Bytes the client sent ahead of the 101 belong to the
                // new protocol.
                sock.unread(&carry);
                proto(sock).await;
            }
            return;
        }

        if !keep_alive || !sock.is_open() {
            break;
        }
    }
}

async fn receive_request(
    sock: &mut TcpSock,
    parser: &mut Parser,
    req: &mut Request,
    config: &HttpConfig,
    carry: &mut Vec<u8>,
) -> RecvOutcome {
    let mut sink = RequestBuilder::new(req, config);
    let mut received_any = !carry.is_empty();
    let mut buf = [0u8; 4096];

    loop {
        if !carry.is_empty() {
            match parser.feed(carry, &mut sink) {
                Ok(consumed) => {
                    carry.drain(..consumed);
                }
                Err(e) => {
                    trace!("parsing request failed: {e:?}");
                    return RecvOutcome::Fail(sink.reject.unwrap_or(Status::BadRequest));
                }
            }
        }
        if parser.message_complete() {
            return RecvOutcome::Complete;
        }

        let n = match sock
            .recv(&mut buf, deadline_after(config.connection_timeout))
            .await
        {
            Ok(0) => {
                // EOF between requests is a normal close; EOF inside a
                // request is a protocol violation.
                return if received_any {
                    RecvOutcome::Fail(Status::BadRequest)
                } else {
                    RecvOutcome::Closed
                };
            }
            Ok(n) => n,
            Err(e) if e.is_timeout() => {
                return if received_any {
                    RecvOutcome::Fail(Status::RequestTimeout)
                } else {
                    RecvOutcome::Closed
                };
            }
            Err(e) => {
                trace!("receive failed: {e}");
                return RecvOutcome::Closed;
            }
        };
        received_any = true;

        match parser.feed(&buf[..n], &mut sink) {
            Ok(consumed) => {
                if consumed < n {
                    carry.extend_from_slice(&buf[consumed..n]);
                }
            }
            Err(e) => {
                trace!("parsing request failed: {e:?}");
                return RecvOutcome::Fail(sink.reject.unwrap_or(Status::BadRequest));
            }
        }
        if parser.message_complete() {
            return RecvOutcome::Complete;
        }
    }
}

/// Serialize and transmit the response. Returns whether the connection
/// may be kept alive.
pub(crate) async fn send_response(
    sock: &mut TcpSock,
    req: &Request,
    resp: &mut Response,
    config: &HttpConfig,
) -> SuilResult<bool> {
    let deadline = deadline_after(config.connection_timeout);
    let keep_alive = req.wants_keep_alive()
        && !resp.close_requested()
        && config.keep_alive_time > 0
        && resp.status != Status::SwitchingProtocols;

    let mut head: Vec<u8> = Vec::with_capacity(256);
    head.extend_from_slice(resp.status.status_line().as_bytes());

    for (name, value) in resp.headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    for cookie in resp.cookies() {
        cookie.write_header(&mut head);
    }

    if keep_alive {
        head.extend_from_slice(b"Connection: Keep-Alive\r\nKeep-Alive: ");
        let mut fmt = itoa::Buffer::new();
        head.extend_from_slice(fmt.format(config.keep_alive_time).as_bytes());
        head.extend_from_slice(b"\r\n");
    } else if resp.status != Status::SwitchingProtocols {
        head.extend_from_slice(b"Connection: Close\r\n");
    }

    if config.hsts_enable > 0 && !resp.headers.contains("Strict-Transport-Security") {
        head.extend_from_slice(b"Strict-Transport-Security: max-age=");
        let mut fmt = itoa::Buffer::new();
        head.extend_from_slice(fmt.format(config.hsts_enable).as_bytes());
        head.extend_from_slice(b"; includeSubdomains\r\n");
    }

    if !resp.headers.contains("Server") {
        head.extend_from_slice(b"Server: ");
        head.extend_from_slice(config.server_name.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if !resp.headers.contains("Date") {
        head.extend_from_slice(b"Date: ");
        head.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if resp.status != Status::SwitchingProtocols {
        head.extend_from_slice(b"Content-Length: ");
        let mut fmt = itoa::Buffer::new();
        head.extend_from_slice(fmt.format(resp.content_length()).as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"\r\n");
    sock.send(&head, deadline).await?;

    // HEAD answers carry headers only.
    if req.method != Method::Head {
        if resp.chunks().is_empty() {
            send_segmented(sock, resp.inline_body(), config, deadline).await?;
        } else {
            for chunk in resp.take_chunks() {
                match chunk {
                    Chunk::Buf { data, off, len } => {
                        send_segmented(sock, &data[off..off + len], config, deadline).await?;
                    }
                    Chunk::File { file, off, len } => {
                        send_file_chunk(sock, &file, off, len, config, deadline).await?;
                    }
                }
            }
        }
    }

    sock.flush(deadline).await?;
    Ok(keep_alive)
}

async fn send_segmented(
    sock: &mut TcpSock,
    data: &[u8],
    config: &HttpConfig,
    deadline: i64,
) -> SuilResult<()> {
    let mut sent = 0;
    while sent < data.len() {
        let take = config.send_chunk.min(data.len() - sent);
        sock.send(&data[sent..sent + take], deadline).await?;
        sent += take;
    }
    Ok(())
}

async fn send_file_chunk(
    sock: &mut TcpSock,
    file: &std::fs::File,
    off: u64,
    len: usize,
    config: &HttpConfig,
    deadline: i64,
) -> SuilResult<()> {
    if sock.supports_sendfile() {
        let mut sent = 0;
        while sent < len {
            let take = config.send_chunk.min(len - sent);
            let n = sock
                .sendfile(file.as_raw_fd(), off as i64 + sent as i64, take, deadline)
                .await?;
            if n == 0 {
                break;
            }
            sent += n;
        }
        return Ok(());
    }

    // Adaptors without zero-copy support stream through a buffer.
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(off))?;
    let mut left = len;
    let mut buf = vec![0u8; 64 * 1024];
    while left > 0 {
        let take = buf.len().min(left);
        let n = file.read(&mut buf[..take])?;
        if n == 0 {
            break;
        }
        sock.send(&buf[..n], deadline).await?;
        left -= n;
    }
    Ok(())
}
