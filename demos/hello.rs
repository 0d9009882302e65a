// demos/hello.rs
use suil::http::Middleware;
use suil::{
    HandlerResult, HttpConfig, HttpError, MiddlewareChain, Request, Response, Router, Status,
    http_server,
};

fn hello(_req: &mut Request, resp: &mut Response) -> HandlerResult {
    resp.append(b"Hello World").end(Status::Ok);
    Ok(())
}

fn add(req: &mut Request, resp: &mut Response) -> HandlerResult {
    let a = req.params.int(0).ok_or_else(|| HttpError::bad_request("missing lhs"))?;
    let b = req.params.int(1).ok_or_else(|| HttpError::bad_request("missing rhs"))?;
    resp.append(format!("{}", a + b).as_bytes()).end(Status::Ok);
    Ok(())
}

fn params(req: &mut Request, resp: &mut Response) -> HandlerResult {
    let name = req.query_str("name").map(str::to_string);
    let email = req.query_str("email").map(str::to_string);
    match (name, email) {
        (Some(name), Some(email)) => {
            resp.append(format!("registered {name} <{email}>").as_bytes())
                .end(Status::Ok);
            Ok(())
        }
        _ => Err(HttpError::bad_request("both name and email are required")),
    }
}

struct RequestLog;

struct RequestLogCtx {
    started: i64,
}

impl Middleware for RequestLog {
    fn context(&self) -> Box<dyn std::any::Any> {
        Box::new(RequestLogCtx {
            started: suil::runtime::now_ms(),
        })
    }

    fn after(&self, req: &mut Request, resp: &mut Response) {
        let elapsed = req
            .context::<RequestLogCtx>()
            .map(|c| suil::runtime::now_ms() - c.started)
            .unwrap_or(0);
        println!(
            "{} {} -> {} in {}ms",
            req.method.as_str(),
            req.path(),
            resp.status.code(),
            elapsed
        );
    }
}

fn main() {
    suil::init_logging();

    let mut router = Router::new();
    router.get("/hello", hello);
    router.get("/add/<int>/<int>", add);
    router.get("/params", params);

    let mut middlewares = MiddlewareChain::new();
    middlewares.push(RequestLog);

    println!("Serving on 0.0.0.0:8000");
    http_server("0.0.0.0:8000", router, HttpConfig::default(), middlewares)
        .workers(2)
        .serve()
        .unwrap();
}
