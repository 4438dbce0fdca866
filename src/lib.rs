//! # tsu-access
//!
//! Access logging for services behind a reverse proxy, on top of a minimal
//! hyper-based router.
//!
//! ## What it does
//!
//! - **Client address resolution**: [`client_ip`] untangles `X-Forwarded-For`
//!   and a fixed list of vendor headers (`CF-Connecting-IP`, `X-Real-IP`, ...)
//!   into one best-guess address.
//! - **Request timing**: a monotonic start time captured before routing, and
//!   the elapsed time measured once the handler is done. Optionally it is
//!   echoed to the client as `x-response-time`.
//! - **One access line per request** in Common or Apache Combined format,
//!   written after the response is finalized, off the response path.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tsu_access::{Request, Response, Router, Server};
//! use tsu_access::middleware::{AccessLog, LogFormat};
//!
//! #[tokio::main]
//! async fn main() {
//!     tracing_subscriber::fmt::init();
//!
//!     let app = Router::new()
//!         .get("/users/{id}", get_user)
//!         .layer(AccessLog::new().format(LogFormat::ApacheCombined));
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```
//!
//! Which logs, through `tracing`:
//!
//! ```text
//! 203.0.113.5 [19/Oct/2026:14:02:11 +0200] GET /users/42 200 - "curl/8.5.0" 0.3ms
//! ```

pub mod client_ip;
mod error;
mod handler;
pub mod middleware;
mod request;
mod response;
mod router;
mod server;

pub use client_ip::{HeaderSource, client_ip};
pub use error::Error;
pub use handler::Handler;
pub use http::{Method, StatusCode};
pub use request::{Request, RequestHead};
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
