//! Minimal example: a few JSON endpoints behind the access logger.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -H 'x-forwarded-for: unknown, 203.0.113.5:8080' http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42

use tsu_access::middleware::{AccessLog, LogFormat};
use tsu_access::{Request, Response, Router, Server, StatusCode};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let access_log = AccessLog::new()
        .format(LogFormat::ApacheCombined)
        .include_duration(true);

    let app = Router::new()
        .get("/users/{id}",    get_user)
        .post("/users",        create_user)
        .delete("/users/{id}", delete_user)
        .layer(access_log);

    Server::bind("0.0.0.0:3000")
        .serve(app)
        .await
        .expect("server error");
}

// GET /users/{id}
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    let ip = req.client_ip().unwrap_or("-");
    Response::json(format!(r#"{{"id":"{id}","name":"alice","seen_from":"{ip}"}}"#))
}

// POST /users
async fn create_user(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }

    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(r#"{"id":"99","name":"new_user"}"#)
}

// DELETE /users/{id} → 204 No Content
async fn delete_user(_req: Request) -> StatusCode {
    StatusCode::NO_CONTENT
}
