//! Middleware chain. The set of middlewares is fixed at server
//! construction; each request gets one default-constructed context per
//! middleware, stored in the request as type-erased slots. `before`
//! hooks run in declaration order and may short-circuit by completing
//! the response or returning an error; `after` hooks run in reverse
//! order for every middleware whose `before` was invoked, always.

use std::any::Any;

use crate::http::request::Request;
use crate::http::response::{HandlerResult, Response};

pub trait Middleware: Send + Sync {
    /// Build the per-request context for this middleware. It lands in
    /// the request's context slots and is dropped after `after` ran.
    fn context(&self) -> Box<dyn Any> {
        Box::new(())
    }

    fn before(&self, req: &mut Request, resp: &mut Response) -> HandlerResult {
        let _ = (req, resp);
        Ok(())
    }

    fn after(&self, req: &mut Request, resp: &mut Response) {
        let _ = (req, resp);
    }
}

#[derive(Default)]
pub struct MiddlewareChain {
    items: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, mw: impl Middleware + 'static) {
        self.items.push(Box::new(mw));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn make_contexts(&self) -> Vec<Box<dyn Any>> {
        self.items.iter().map(|mw| mw.context()).collect()
    }

    /// Run `before` hooks in order. Returns how many middlewares were
    /// entered and the first error, if any. A completed response stops
    /// the chain before the next middleware is entered.
    pub fn run_before(&self, req: &mut Request, resp: &mut Response) -> (usize, HandlerResult) {
        let mut entered = 0;
        for mw in &self.items {
            if resp.is_completed() {
                break;
            }
            entered += 1;
            if let Err(e) = mw.before(req, resp) {
                return (entered, Err(e));
            }
        }
        (entered, Ok(()))
    }

    /// Run `after` hooks in reverse for the `entered` prefix.
    pub fn run_after(&self, entered: usize, req: &mut Request, resp: &mut Response) {
        for mw in self.items[..entered].iter().rev() {
            mw.after(req, resp);
        }
    }
}
