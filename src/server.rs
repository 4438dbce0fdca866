//! HTTP server and graceful shutdown.
//!
//! On SIGTERM (Kubernetes) or Ctrl-C the server stops accepting, lets every
//! in-flight connection finish, then returns from [`Server::serve`].
//!
//! Each request runs through the router's middleware chain. The response is
//! returned to hyper as soon as it is assembled; deferred middleware work
//! (access logging) is spawned as a separate task and never delays it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::middleware::{Context, Deferred};
use crate::request::{Request, RequestHead};
use crate::response::Response;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = Arc::new(router);

        info!(addr = %self.addr, middleware = router.middleware().len(), "tsu listening");

        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // shutdown first, so a SIGTERM stops accepting even under load
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { dispatch(router, req, remote_addr).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("tsu stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// hyper entry point: buffers the body, handles the request, spawns the
/// deferred jobs, and hands the response back.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let head = RequestHead::from(parts).with_remote_addr(remote_addr);

    let body = match body.collect().await {
        Ok(collected) => Some(collected.to_bytes()),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            None
        }
    };

    let (response, deferred) = handle(&router, head, body).await;
    deferred.spawn();
    Ok(response)
}

/// Runs one request through pre-hooks, handler and post-hooks.
///
/// `body` is `None` when it could not be read; that request gets a `400`
/// result without reaching a handler. Unmatched routes produce a `404`
/// result. Either way the hooks still run.
pub(crate) async fn handle(
    router: &Router,
    head: RequestHead,
    body: Option<Bytes>,
) -> (http::Response<Full<Bytes>>, Deferred) {
    let mut ctx = Context::new(head);

    for middleware in router.middleware() {
        middleware.on_pre_request(&mut ctx);
    }

    let head = ctx.request().clone();
    let result = match (body, router.lookup(head.method(), head.path())) {
        (None, _) => Response::status(StatusCode::BAD_REQUEST),
        (Some(body), Some((handler, params))) => {
            handler.call(Request::new(head, body, params)).await
        }
        (Some(_), None) => Response::status(StatusCode::NOT_FOUND),
    };
    ctx.set_result(result);

    for middleware in router.middleware().iter().rev() {
        middleware.on_post_request(&mut ctx);
    }

    ctx.finish()
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C (Ctrl-C only on non-Unix targets).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use http::{HeaderMap, HeaderValue, Method, Uri};

    use super::*;
    use crate::middleware::{AccessLog, Middleware};

    /// Records hook order into a shared log.
    struct Recorder(&'static str, Arc<Mutex<Vec<String>>>);

    impl Middleware for Recorder {
        fn on_pre_request(&self, _ctx: &mut Context) {
            self.1.lock().unwrap().push(format!("pre:{}", self.0));
        }

        fn on_post_request(&self, ctx: &mut Context) {
            let status = ctx.result().and_then(Response::status_code);
            self.1.lock().unwrap().push(format!("post:{}:{status:?}", self.0));
        }
    }

    async fn echo_id(req: Request) -> Response {
        Response::text(req.param("id").unwrap_or_default().to_owned())
    }

    fn head(method: Method, uri: &'static str) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.44"));
        RequestHead::new(method, Uri::from_static(uri), headers)
    }

    #[tokio::test]
    async fn hooks_wrap_the_handler_in_onion_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .get("/users/{id}", echo_id)
            .layer(Recorder("outer", Arc::clone(&calls)))
            .layer(Recorder("inner", Arc::clone(&calls)));

        let (res, _) = handle(&router, head(Method::GET, "/users/7"), Some(Bytes::new())).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "pre:outer",
                "pre:inner",
                "post:inner:Some(200)",
                "post:outer:Some(200)",
            ]
        );
    }

    #[tokio::test]
    async fn access_line_for_routed_and_unrouted_requests() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let router = Router::new()
            .get("/users/{id}", echo_id)
            .layer(AccessLog::new().include_duration(true).logger(move |line| {
                sink.lock().unwrap().push(line.to_owned());
            }));

        let (res, deferred) = handle(&router, head(Method::GET, "/users/7?full=1"), Some(Bytes::new())).await;
        assert!(res.headers().contains_key("x-response-time"));
        deferred.run();

        let (res, deferred) = handle(&router, head(Method::POST, "/nowhere"), Some(Bytes::new())).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        deferred.run();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("192.0.2.44 ["), "{}", lines[0]);
        assert!(lines[0].contains("] GET /users/7?full=1 200 "), "{}", lines[0]);
        assert!(lines[1].contains("] POST /nowhere 404 "), "{}", lines[1]);
    }

    #[tokio::test]
    async fn unreadable_body_is_still_logged() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let router = Router::new()
            .post("/users/{id}", echo_id)
            .layer(Recorder("rec", Arc::clone(&calls)))
            .layer(AccessLog::new().logger(move |line| {
                sink.lock().unwrap().push(line.to_owned());
            }));

        let (res, deferred) = handle(&router, head(Method::POST, "/users/3"), None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        deferred.run();

        assert_eq!(*calls.lock().unwrap(), vec!["pre:rec", "post:rec:Some(400)"]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("] POST /users/3 400 "), "{}", lines[0]);
    }

    #[tokio::test]
    async fn spawned_access_line_arrives() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let router = Router::new()
            .get("/users/{id}", echo_id)
            .layer(AccessLog::new().logger(move |line| {
                let _ = tx.send(line.to_owned());
            }));

        let (_, deferred) = handle(&router, head(Method::GET, "/users/1"), Some(Bytes::new())).await;
        deferred.spawn();

        let line = rx.recv().await.unwrap();
        assert!(line.contains(" GET /users/1 200 "), "{line}");
    }
}
