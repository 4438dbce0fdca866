//! Middleware layer.
//!
//! A middleware gets two hooks around the handler:
//!
//! ```text
//! on_pre_request(ctx)     ← before routing, in registration order
//!        ↓
//! handler(req)            → ctx.result
//!        ↓
//! on_post_request(ctx)    ← after the handler, in reverse order
//!        ↓
//! ctx.finish()            → response sent, deferred jobs spawned
//! ```
//!
//! Per-request data lives in [`Context::state_mut`], a type-keyed map. Each
//! middleware stores its own private type there, so two middlewares never
//! overwrite each other's slot and nothing leaks between requests.
//!
//! Work that must observe the *final* response (status included) and must not
//! delay it is registered with [`Context::defer`]. It runs on a spawned task
//! once the response has been assembled.
//!
//! Built-in middleware:
//! - [`AccessLog`]: one Common / Apache Combined log line per request

mod access_log;

pub use access_log::{AccessLog, LogFormat, Sink};

use bytes::Bytes;
use http::{Extensions, StatusCode};
use http_body_util::Full;

use crate::client_ip::HeaderSource;
use crate::request::RequestHead;
use crate::response::Response;

/// Request/response interceptor.
///
/// Both hooks default to doing nothing, so implement only what you need.
pub trait Middleware: Send + Sync + 'static {
    fn on_pre_request(&self, _ctx: &mut Context) {}

    fn on_post_request(&self, _ctx: &mut Context) {}
}

type Job = Box<dyn FnOnce(&Exchange) + Send + 'static>;

// ── Context ───────────────────────────────────────────────────────────────────

/// Everything one request owns while it passes through the middleware chain.
pub struct Context {
    head: RequestHead,
    response: Response,
    result: Option<Response>,
    state: Extensions,
    deferred: Vec<Job>,
}

impl Context {
    pub fn new(head: RequestHead) -> Self {
        Self {
            head,
            response: Response::empty(),
            result: None,
            state: Extensions::new(),
            deferred: Vec::new(),
        }
    }

    pub fn request(&self) -> &RequestHead { &self.head }

    /// The outgoing response shell. Headers set here are sent on top of the
    /// handler result's headers.
    pub fn response(&self) -> &Response { &self.response }
    pub fn response_mut(&mut self) -> &mut Response { &mut self.response }

    /// What the handler returned, once it has run.
    pub fn result(&self) -> Option<&Response> { self.result.as_ref() }

    pub fn set_result(&mut self, result: Response) {
        self.result = Some(result);
    }

    pub fn state(&self) -> &Extensions { &self.state }
    pub fn state_mut(&mut self) -> &mut Extensions { &mut self.state }

    /// Schedules `job` to run after the response is finalized.
    ///
    /// The job sees an immutable [`Exchange`]; it can no longer change what
    /// the client receives.
    pub fn defer<F>(&mut self, job: F)
    where
        F: FnOnce(&Exchange) + Send + 'static,
    {
        self.deferred.push(Box::new(job));
    }

    /// Merges the handler result into the response shell.
    ///
    /// The result provides body, headers and status; headers set on the shell
    /// win over the result's. Status is the result's, else the shell's, else
    /// `200 OK` on the wire.
    pub fn finish(self) -> (http::Response<Full<Bytes>>, Deferred) {
        let Context { head, response: shell, result, deferred, .. } = self;

        let result_status = result.as_ref().and_then(Response::status_code);
        let mut response = result.unwrap_or_else(Response::empty);
        response.headers.extend(shell.headers);
        response.status = result_status.or(shell.status);

        let exchange = Exchange { head, result_status, status: response.status };
        (response.into_inner(), Deferred { exchange, jobs: deferred })
    }
}

// ── Exchange ──────────────────────────────────────────────────────────────────

/// A finished request/response pair, as seen by deferred jobs.
#[derive(Clone, Debug)]
pub struct Exchange {
    head: RequestHead,
    result_status: Option<StatusCode>,
    status: Option<StatusCode>,
}

impl Exchange {
    pub fn request(&self) -> &RequestHead { &self.head }

    /// Status carried by the handler's result, if any.
    pub fn result_status(&self) -> Option<StatusCode> { self.result_status }

    /// Status of the finalized response, if one was decided.
    pub fn status(&self) -> Option<StatusCode> { self.status }
}

impl HeaderSource for Exchange {
    fn header_lines(&self, name: &str) -> Vec<&[u8]> { self.head.header_lines(name) }
    fn has(&self, name: &str) -> bool { self.head.has(name) }
}

// ── Deferred ──────────────────────────────────────────────────────────────────

/// Jobs registered with [`Context::defer`], bundled with the exchange they
/// report on.
pub struct Deferred {
    exchange: Exchange,
    jobs: Vec<Job>,
}

impl Deferred {
    pub fn exchange(&self) -> &Exchange { &self.exchange }

    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }

    /// Runs every job inline, in registration order.
    pub fn run(self) {
        let Deferred { exchange, jobs } = self;
        for job in jobs {
            job(&exchange);
        }
    }

    /// Hands the jobs to the tokio runtime and returns immediately.
    ///
    /// Fire-and-forget: there is no handle, no timeout and no cancellation. A
    /// panicking job takes down only its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) {
        if self.jobs.is_empty() {
            return;
        }
        tokio::spawn(async move { self.run() });
    }
}
