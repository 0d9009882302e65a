// demos/wsock_echo.rs
use suil::http::wsock::{self, WebSockApi};
use suil::{HttpConfig, MiddlewareChain, Router, Status, http_server};

fn main() {
    suil::init_logging();

    let api = WebSockApi::builder()
        .timeout(30_000)
        .on_connect(|ws| {
            println!("peer {} connected", ws.id());
            true
        })
        .on_message(|ws, data, op| {
            // Echo every frame straight back, and fan text frames out
            // to every other peer in the group.
            ws.send(data, op);
            ws.broadcast(data, op);
        })
        .on_close(|ws| println!("peer {} closed", ws.id()))
        .build();

    let mut router = Router::new();
    let echo_api = api.clone();
    router.get("/echo", move |req, resp| {
        wsock::handshake(req, resp, echo_api.clone())
    });
    router.get("/", |_req, resp| {
        resp.append(b"websocket echo lives at /echo").end(Status::Ok);
        Ok(())
    });

    println!("Serving on 0.0.0.0:8000");
    http_server(
        "0.0.0.0:8000",
        router,
        HttpConfig::default(),
        MiddlewareChain::new(),
    )
    .workers(2)
    .serve()
    .unwrap();
}
