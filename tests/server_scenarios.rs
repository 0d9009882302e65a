//! End-to-end scenarios against a live server on a loopback socket,
//! speaking raw bytes from plain blocking clients.

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use suil::http::fserver::{FileServer, FileServerConfig};
use suil::http::wsock::{self, WebSockApi};
use suil::http::{Cookie, Middleware};
use suil::runtime::Executor;
use suil::{
    HandlerResult, HttpConfig, HttpError, MiddlewareChain, Request, Response, Router, RpcConfig,
    Status, http_server,
};

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn http(router: Router, config: HttpConfig, middlewares: MiddlewareChain) -> Self {
        let bound = http_server("127.0.0.1:0", router, config, middlewares)
            .workers(1)
            .into_bound()
            .expect("binding test server");
        let addr = bound.local_addr().unwrap();
        let shutdown = bound.shutdown_flag();
        let handle = thread::spawn(move || {
            let _ = bound.run();
        });
        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connecting to test server");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct HttpReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpReply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

fn read_reply(stream: &mut TcpStream) -> HttpReply {
    let mut acc = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = acc.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf).expect("reading response head");
        assert!(n > 0, "connection closed before headers completed");
        acc.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&acc[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| {
            let (k, v) = l.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = acc[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).expect("reading response body");
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    HttpReply {
        status,
        headers,
        body,
    }
}

fn roundtrip(server: &TestServer, raw: &[u8]) -> HttpReply {
    let mut stream = server.connect();
    stream.write_all(raw).unwrap();
    read_reply(&mut stream)
}

fn hello_router() -> Router {
    let mut router = Router::new();
    router.get("/hello", |_req, resp| {
        resp.append(b"Hello World").end(Status::Ok);
        Ok(())
    });
    router.get("/add/<int>/<int>", |req, resp| {
        let a = req.params.int(0).unwrap_or(0);
        let b = req.params.int(1).unwrap_or(0);
        resp.append(format!("{}", a + b).as_bytes()).end(Status::Ok);
        Ok(())
    });
    router.get("/params", |req, resp| {
        if req.query_str("name").is_none() || req.query_str("email").is_none() {
            return Err(HttpError::bad_request("name and email are required"));
        }
        resp.append(b"ok").end(Status::Ok);
        Ok(())
    });
    router.get("/docs/", |_req, resp| {
        resp.append(b"docs index").end(Status::Ok);
        Ok(())
    });
    router
}

#[test]
fn s1_get_hello_world() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Length"), Some("11"));
    assert_eq!(reply.body, b"Hello World");
    assert!(reply.header("Server").unwrap().starts_with("suil/"));
    assert!(reply.header("Date").is_some());
}

#[test]
fn s2_typed_route_adds_ints() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /add/3/4 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"7");
}

#[test]
fn s3_missing_query_param_is_rejected() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /params?name=Ada HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 400);
}

#[test]
fn s8_trailing_slash_redirect() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /docs HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 301);
    assert_eq!(reply.header("Location"), Some("/docs/"));
}

#[test]
fn unknown_route_and_method_mismatch() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 404);

    let reply = roundtrip(&server, b"POST /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 405);
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = TestServer::http(hello_router(), HttpConfig::default(), MiddlewareChain::new());
    let mut stream = server.connect();

    for _ in 0..3 {
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let reply = read_reply(&mut stream);
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"Hello World");
        assert_eq!(reply.header("Connection"), Some("Keep-Alive"));
        assert_eq!(reply.header("Keep-Alive"), Some("3600"));
    }
}

#[test]
fn cookies_emit_one_header_each_in_order() {
    let mut router = Router::new();
    router.get("/cookies", |_req, resp| {
        resp.cookie(Cookie::new("first", "1"));
        resp.cookie(Cookie::new("second", "2").path("/"));
        resp.append(b"ok").end(Status::Ok);
        Ok(())
    });
    let server = TestServer::http(router, HttpConfig::default(), MiddlewareChain::new());
    let reply = roundtrip(&server, b"GET /cookies HTTP/1.1\r\nHost: x\r\n\r\n");
    let cookies = reply.headers_named("Set-Cookie");
    assert_eq!(cookies, vec!["first=1", "second=2; Path=/"]);
}

#[test]
fn s4_disk_offload_round_trip() {
    let offload_dir =
        std::env::temp_dir().join(format!("suil-e2e-offload-{}", std::process::id()));
    let _ = fs::remove_dir_all(&offload_dir);

    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut router = Router::new();
    let check_dir = offload_dir.clone();
    router.post("/upload", move |req, resp| {
        if !req.body_offloaded() {
            return Err(HttpError::internal("body was not offloaded"));
        }
        // The offload file must exist while the request is alive.
        let files = fs::read_dir(&check_dir).map_err(|e| HttpError::internal(e.to_string()))?;
        if files.count() == 0 {
            return Err(HttpError::internal("no offload file on disk"));
        }

        let mut got = Vec::new();
        let mut buf = [0u8; 600];
        loop {
            let n = req
                .read_body(&mut buf)
                .map_err(|e| HttpError::internal(e.to_string()))?;
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        if got != expected {
            return Err(HttpError::internal("body bytes do not match"));
        }
        resp.append(b"stored").end(Status::Ok);
        Ok(())
    });

    let config = HttpConfig {
        disk_offload: true,
        disk_offload_min: 1024,
        max_body_len: 10 * 1024 * 1024,
        offload_path: offload_dir.clone(),
        ..Default::default()
    };
    let server = TestServer::http(router, config, MiddlewareChain::new());

    let mut raw = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    raw.extend_from_slice(&payload);
    let reply = roundtrip(&server, &raw);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"stored");

    // The offload file is unlinked once the request is dropped.
    thread::sleep(Duration::from_millis(200));
    let leftovers = fs::read_dir(&offload_dir).unwrap().count();
    assert_eq!(leftovers, 0);
    let _ = fs::remove_dir_all(&offload_dir);
}

#[test]
fn oversized_body_is_rejected_with_413() {
    let mut router = Router::new();
    router.post("/upload", |_req, resp| {
        resp.append(b"ok").end(Status::Ok);
        Ok(())
    });
    let config = HttpConfig {
        max_body_len: 128,
        ..Default::default()
    };
    let server = TestServer::http(router, config, MiddlewareChain::new());
    let reply = roundtrip(
        &server,
        b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 4096\r\n\r\n",
    );
    assert_eq!(reply.status, 413);
}

fn static_site(file_len: usize) -> (PathBuf, Vec<u8>) {
    let dir = std::env::temp_dir().join(format!(
        "suil-e2e-www-{}-{file_len}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let content: Vec<u8> = (0..file_len as u32).map(|i| (i * 7 % 256) as u8).collect();
    fs::write(dir.join("asset.bin"), &content).unwrap();
    fs::write(dir.join("index.html"), b"<h1>home</h1>").unwrap();
    (dir, content)
}

#[test]
fn s5_single_range_get() {
    let (dir, content) = static_site(1000);
    let mut router = Router::new();
    FileServer::attach(
        &mut router,
        FileServerConfig {
            root: dir.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    let server = TestServer::http(router, HttpConfig::default(), MiddlewareChain::new());

    let reply = roundtrip(
        &server,
        b"GET /asset.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=100-199\r\n\r\n",
    );
    assert_eq!(reply.status, 206);
    assert_eq!(reply.header("Content-Range"), Some("bytes 100-199/1000"));
    assert_eq!(reply.header("Content-Length"), Some("100"));
    assert_eq!(reply.body, &content[100..200]);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn range_edge_cases() {
    let (dir, content) = static_site(500);
    let mut router = Router::new();
    FileServer::attach(
        &mut router,
        FileServerConfig {
            root: dir.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    let server = TestServer::http(router, HttpConfig::default(), MiddlewareChain::new());

    // Whole file with range support advertised.
    let reply = roundtrip(&server, b"GET /asset.bin HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Accept-Ranges"), Some("bytes"));
    assert_eq!(reply.body, content);

    // Multiple ranges are not implemented.
    let reply = roundtrip(
        &server,
        b"GET /asset.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=0-1,10-20\r\n\r\n",
    );
    assert_eq!(reply.status, 406);

    // Out of bounds.
    let reply = roundtrip(
        &server,
        b"GET /asset.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=400-900\r\n\r\n",
    );
    assert_eq!(reply.status, 416);

    // Directory URL resolves the index file.
    let reply = roundtrip(&server, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"<h1>home</h1>");
    assert_eq!(reply.header("Content-Type"), Some("text/html"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn auth_middleware_rejects_and_recovers() {
    struct TokenAuth;
    impl Middleware for TokenAuth {
        fn before(&self, req: &mut Request, _resp: &mut Response) -> HandlerResult {
            match req.header("X-Token") {
                Some("sesame") => Ok(()),
                _ => Err(HttpError::unauthorized("missing or invalid token")),
            }
        }
    }

    let mut middlewares = MiddlewareChain::new();
    middlewares.push(TokenAuth);
    let server = TestServer::http(hello_router(), HttpConfig::default(), middlewares);

    let reply = roundtrip(&server, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 401);
    assert!(reply.header("WWW-Authenticate").is_some());

    let reply = roundtrip(
        &server,
        b"GET /hello HTTP/1.1\r\nHost: x\r\nX-Token: sesame\r\n\r\n",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"Hello World");
}

// ---- WebSocket ----

fn ws_frame(op: u8, payload: &[u8]) -> Vec<u8> {
    // Client frames must be masked.
    let mask = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![0x80 | op];
    if payload.len() <= 125 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    for (i, b) in payload.iter().enumerate() {
        frame.push(b ^ mask[i % 4]);
    }
    frame
}

fn read_ws_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).unwrap();
    assert_eq!(hdr[1] & 0x80, 0, "server frames are not masked");
    let len = match (hdr[1] & 0x7F) as usize {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (hdr[0] & 0x0F, payload)
}

#[test]
fn s6_websocket_echo() {
    let api = WebSockApi::builder()
        .timeout(5000)
        .on_message(|ws, data, op| ws.send(data, op))
        .build();

    let mut router = Router::new();
    router.get("/echo", move |req, resp| {
        wsock::handshake(req, resp, api.clone())
    });
    let server = TestServer::http(router, HttpConfig::default(), MiddlewareChain::new());

    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /echo HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 101);
    assert_eq!(
        reply.header("Sec-WebSocket-Accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert_eq!(reply.header("Upgrade"), Some("websocket"));

    // Text frames echo byte-for-byte.
    for msg in [&b"hello"[..], &b"websocket round two"[..]] {
        stream.write_all(&ws_frame(0x1, msg)).unwrap();
        let (op, payload) = read_ws_frame(&mut stream);
        assert_eq!(op, 0x1);
        assert_eq!(payload, msg);
    }

    // Close is answered with close.
    stream.write_all(&ws_frame(0x8, &1000u16.to_be_bytes())).unwrap();
    let (op, _) = read_ws_frame(&mut stream);
    assert_eq!(op, 0x8);
}

#[test]
fn websocket_ping_gets_pong() {
    let api = WebSockApi::builder().timeout(5000).build();
    let mut router = Router::new();
    router.get("/ws", move |req, resp| wsock::handshake(req, resp, api.clone()));
    let server = TestServer::http(router, HttpConfig::default(), MiddlewareChain::new());

    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: c3VpbC10ZXN0LWtleQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 101);

    stream.write_all(&ws_frame(0x9, b"are you there")).unwrap();
    let (op, payload) = read_ws_frame(&mut stream);
    assert_eq!(op, 0xA);
    assert_eq!(payload, b"are you there");
}

// ---- RPC over raw TCP ----

fn envelope(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count().min(7);
    let mut out = vec![(8 - skip) as u8];
    out.extend_from_slice(&be[skip..]);
    out.extend_from_slice(payload);
    out
}

fn read_envelope(stream: &mut TcpStream) -> Vec<u8> {
    let mut lol = [0u8; 1];
    stream.read_exact(&mut lol).unwrap();
    let mut len_bytes = vec![0u8; lol[0] as usize];
    stream.read_exact(&mut len_bytes).unwrap();
    let mut len = 0usize;
    for b in len_bytes {
        len = len << 8 | b as usize;
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

struct RpcTestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RpcTestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Calculator;

impl suil::rpc::JsonRpcHandler for Calculator {
    fn call(
        &self,
        method: &str,
        params: &serde_json::Value,
        _id: Option<i64>,
    ) -> Result<serde_json::Value, suil::rpc::RpcError> {
        match method {
            "add" => {
                let sum: i64 = params
                    .as_array()
                    .map(|a| a.iter().filter_map(serde_json::Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(serde_json::Value::from(sum))
            }
            other => Err(suil::rpc::RpcError::method_not_found(other)),
        }
    }
}

fn start_jsonrpc() -> RpcTestServer {
    let bound = suil::rpc::JsonRpcServer::new(Calculator, RpcConfig::default())
        .bind("127.0.0.1:0")
        .workers(1)
        .into_bound()
        .unwrap();
    let addr = bound.local_addr().unwrap();
    let shutdown = bound.shutdown_flag();
    let handle = thread::spawn(move || {
        let _ = bound.run();
    });
    RpcTestServer {
        addr,
        shutdown,
        handle: Some(handle),
    }
}

#[test]
fn s7_jsonrpc_batch_over_tcp() {
    let server = start_jsonrpc();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let batch = br#"[{"jsonrpc":"2.0","method":"rpc_Version","id":1},{"jsonrpc":"2.0","method":"nope","id":2}]"#;
    stream.write_all(&envelope(batch)).unwrap();
    let reply = read_envelope(&mut stream);
    let parsed: serde_json::Value = serde_json::from_slice(&reply).unwrap();

    let entries = parsed.as_array().expect("batch answers with an array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], 1);
    assert_eq!(entries[0]["result"], suil::version());
    assert!(entries[0].get("error").is_none());
    assert_eq!(entries[1]["id"], 2);
    assert!(entries[1].get("result").is_none());
    assert_eq!(entries[1]["error"]["code"], -32601);
}

#[test]
fn jsonrpc_client_round_trip() {
    let server = start_jsonrpc();
    let addr = server.addr;

    let result: Rc<RefCell<Option<(i64, String)>>> = Rc::new(RefCell::new(None));
    let out = result.clone();
    Executor::block_on(async move {
        let mut client = suil::rpc::JsonRpcClient::connect(addr, RpcConfig::default())
            .await
            .unwrap();
        let sum = client
            .call("add", Some(serde_json::json!([3, 4, 5])))
            .await
            .unwrap();
        let version = client.rpc_version().await.unwrap();
        *out.borrow_mut() = Some((sum.as_i64().unwrap(), version));
    })
    .unwrap();

    let (sum, version) = result.borrow_mut().take().unwrap();
    assert_eq!(sum, 12);
    assert_eq!(version, suil::version());
}

struct EchoRpc;

impl suil::rpc::SuilRpcHandler for EchoRpc {
    fn methods(&self) -> Vec<(i32, String)> {
        vec![(1, "echo".to_string())]
    }

    fn call(&self, method: i32, params: &[u8], _id: u32) -> Result<Vec<u8>, suil::rpc::RpcError> {
        match method {
            1 => Ok(params.to_vec()),
            other => Err(suil::rpc::RpcError::new(
                -32601,
                format!("method {other} does not exist"),
            )),
        }
    }
}

#[test]
fn suilrpc_handshake_and_call() {
    let bound = suil::rpc::SuilRpcServer::new(EchoRpc, RpcConfig::default())
        .bind("127.0.0.1:0")
        .workers(1)
        .into_bound()
        .unwrap();
    let addr = bound.local_addr().unwrap();
    let shutdown = bound.shutdown_flag();
    let handle = thread::spawn(move || {
        let _ = bound.run();
    });
    let server = RpcTestServer {
        addr,
        shutdown,
        handle: Some(handle),
    };

    let result: Rc<RefCell<Option<(String, Vec<u8>)>>> = Rc::new(RefCell::new(None));
    let out = result.clone();
    let addr = server.addr;
    Executor::block_on(async move {
        let mut client = suil::rpc::SuilRpcClient::connect(addr, RpcConfig::default())
            .await
            .unwrap();
        let version = client.server_version().to_string();
        let echoed = client.call("echo", b"binary \x00 payload").await.unwrap();
        *out.borrow_mut() = Some((version, echoed));
    })
    .unwrap();

    let (version, echoed) = result.borrow_mut().take().unwrap();
    assert_eq!(version, suil::version());
    assert_eq!(echoed, b"binary \x00 payload");
}
