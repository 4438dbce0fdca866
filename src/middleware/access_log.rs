//! Access-log middleware.
//!
//! Emits one line per request, in the two formats every log tool understands:
//!
//! ```text
//! Common:          <ip> [<time>] <method> <url> <status> <duration>ms
//! Apache Combined: <ip> [<time>] <method> <url> <status> "<referer>" "<user-agent>" <duration>ms
//! ```
//!
//! Missing fields are written as `-`.
//!
//! The duration is measured inside `on_post_request`, while the response can
//! still take an `x-response-time` header. Everything else is formatted in a
//! deferred job, after the framework has finalized the status, so logging
//! never holds up the response.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, Utc};
use http::HeaderValue;
use tracing::{debug, info};

use super::{Context, Exchange, Middleware};
use crate::client_ip::{HeaderSource, client_ip};

const TIMESTAMP_FORMAT: &str = "[%d/%b/%Y:%H:%M:%S %z]";

/// Access-line layout.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Common,
    /// Common plus two quoted request headers (referer and user agent by default).
    ApacheCombined,
}

/// Destination for finished access lines.
pub type Sink = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Request start, private to this middleware's state slot.
#[derive(Clone, Copy, Debug)]
struct Timing {
    start: Instant,
}

/// Access-log middleware. Register with [`Router::layer`](crate::Router::layer).
///
/// ```rust
/// use tsu_access::middleware::{AccessLog, LogFormat};
///
/// let log = AccessLog::new()
///     .format(LogFormat::ApacheCombined)
///     .utc_time(true)
///     .include_duration(true)
///     .logger(|line| eprintln!("{line}"));
/// ```
#[derive(Clone)]
pub struct AccessLog {
    format: LogFormat,
    utc_time: bool,
    include_duration: bool,
    logger: Sink,
    combined_headers: Vec<String>,
}

impl AccessLog {
    /// Common format, local time, no `x-response-time`, lines sent to
    /// `tracing` at INFO on target `tsu::access`.
    pub fn new() -> Self {
        Self {
            format: LogFormat::Common,
            utc_time: false,
            include_duration: false,
            logger: Arc::new(|line: &str| info!(target: "tsu::access", "{line}")),
            combined_headers: vec!["Referer".to_owned(), "User-agent".to_owned()],
        }
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Timestamps in UTC instead of the server's local zone.
    pub fn utc_time(mut self, enabled: bool) -> Self {
        self.utc_time = enabled;
        self
    }

    /// Also send the duration to the client as `x-response-time`.
    pub fn include_duration(mut self, enabled: bool) -> Self {
        self.include_duration = enabled;
        self
    }

    /// Replaces the default `tracing` sink.
    pub fn logger<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.logger = Arc::new(sink);
        self
    }

    /// Headers logged by [`LogFormat::ApacheCombined`]. Only the first two are used.
    pub fn combined_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.combined_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Milliseconds since the pre-request hook, to one decimal.
    fn duration(&self, ctx: &mut Context) -> String {
        let timing = ctx.state_mut().remove::<Timing>();
        let elapsed = match timing {
            Some(timing) => timing.start.elapsed().as_secs_f64() * 1000.0,
            None => {
                debug!(path = ctx.request().path(), "no request timing recorded");
                0.0
            }
        };
        let duration = format!("{elapsed:.1}");

        if self.include_duration {
            if let Ok(value) = HeaderValue::from_str(&duration) {
                ctx.response_mut().headers_mut().insert("x-response-time", value);
            }
        }
        duration
    }

    fn timestamp(&self) -> String {
        if self.utc_time {
            Utc::now().format(TIMESTAMP_FORMAT).to_string()
        } else {
            Local::now().format(TIMESTAMP_FORMAT).to_string()
        }
    }

    /// Assembles the full line for a finished exchange.
    pub(crate) fn line(&self, exchange: &Exchange, duration: &str) -> String {
        let request = exchange.request();
        let mut parts = vec![
            client_ip(exchange).unwrap_or("-").to_owned(),
            self.timestamp(),
            request.method().to_string(),
            request.path_and_query().to_owned(),
            status(exchange),
        ];

        if self.format == LogFormat::ApacheCombined {
            parts.extend(
                self.combined_headers
                    .iter()
                    .take(2)
                    .map(|name| quoted_header(exchange, name)),
            );
        }

        parts.push(format!("{duration}ms"));
        parts.join(" ")
    }
}

impl Default for AccessLog {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLog")
            .field("format", &self.format)
            .field("utc_time", &self.utc_time)
            .field("include_duration", &self.include_duration)
            .field("combined_headers", &self.combined_headers)
            .finish_non_exhaustive()
    }
}

impl Middleware for AccessLog {
    fn on_pre_request(&self, ctx: &mut Context) {
        ctx.state_mut().insert(Timing { start: Instant::now() });
    }

    fn on_post_request(&self, ctx: &mut Context) {
        let duration = self.duration(ctx);
        let this = self.clone();
        ctx.defer(move |exchange| {
            let line = this.line(exchange, &duration);
            (this.logger)(&line);
        });
    }
}

/// Result status, else response status, else `-`.
fn status(exchange: &Exchange) -> String {
    exchange
        .result_status()
        .or(exchange.status())
        .map_or_else(|| "-".to_owned(), |code| code.as_u16().to_string())
}

/// `"value"` as received (lossy for non-UTF-8 bytes), or `-` when absent.
fn quoted_header(headers: &impl HeaderSource, name: &str) -> String {
    match headers.header(name) {
        Some(value) => format!("\"{value}\""),
        None => "-".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::DateTime;
    use http::{HeaderMap, Method, StatusCode, Uri};

    use super::*;
    use crate::request::RequestHead;
    use crate::response::Response;

    fn head(uri: &'static str, pairs: &[(&'static str, &'static str)]) -> RequestHead {
        let mut headers = HeaderMap::new();
        for &(name, value) in pairs {
            headers.append(name, HeaderValue::from_static(value));
        }
        RequestHead::new(Method::GET, Uri::from_static(uri), headers)
    }

    fn capture(log: AccessLog) -> (AccessLog, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (log.logger(move |line| sink.lock().unwrap().push(line.to_owned())), lines)
    }

    /// Drives both hooks around a handler result and runs the deferred jobs.
    fn exercise(
        log: &AccessLog,
        head: RequestHead,
        result: Option<Response>,
    ) -> http::Response<http_body_util::Full<bytes::Bytes>> {
        let mut ctx = Context::new(head);
        log.on_pre_request(&mut ctx);
        if let Some(result) = result {
            ctx.set_result(result);
        }
        log.on_post_request(&mut ctx);
        let (res, deferred) = ctx.finish();
        deferred.run();
        res
    }

    fn is_duration(token: &str) -> bool {
        let Some(number) = token.strip_suffix("ms") else { return false };
        let Some((whole, fraction)) = number.split_once('.') else { return false };
        !whole.is_empty()
            && whole.chars().all(|c| c.is_ascii_digit())
            && fraction.len() == 1
            && fraction.chars().all(|c| c.is_ascii_digit())
    }

    #[test]
    fn common_line_layout() {
        let (log, lines) = capture(AccessLog::new());
        let head = head(
            "/search?q=tsu&page=2",
            &[("x-forwarded-for", "203.0.113.5, 70.41.3.18"), ("referer", "https://a.example")],
        );
        exercise(&log, head, Some(Response::status(StatusCode::NO_CONTENT)));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        let tokens: Vec<&str> = lines[0].split(' ').collect();
        // ip, "[date", "zone]", method, url, status, duration
        assert_eq!(tokens.len(), 7);
        assert_eq!(tokens[0], "203.0.113.5");
        assert!(tokens[1].starts_with('['));
        assert!(tokens[2].ends_with(']'));
        assert_eq!(tokens[3], "GET");
        assert_eq!(tokens[4], "/search?q=tsu&page=2");
        assert_eq!(tokens[5], "204");
        assert!(is_duration(tokens[6]), "{}", tokens[6]);
        assert!(!lines[0].contains('"'));
    }

    #[test]
    fn combined_line_has_two_quoted_headers() {
        let (log, lines) = capture(AccessLog::new().format(LogFormat::ApacheCombined));
        let head = head("/", &[("referer", "https://a.example/"), ("user-agent", "curl/8.0")]);
        exercise(&log, head, Some(Response::text("ok")));

        let line = lines.lock().unwrap().remove(0);
        let tokens: Vec<&str> = line.split(' ').collect();
        assert_eq!(tokens.len(), 9);
        assert_eq!(tokens[5], "200");
        assert_eq!(tokens[6], "\"https://a.example/\"");
        assert_eq!(tokens[7], "\"curl/8.0\"");
        assert!(is_duration(tokens[8]));
    }

    #[test]
    fn combined_headers_missing_render_as_dash_and_extra_names_ignored() {
        let log = AccessLog::new()
            .format(LogFormat::ApacheCombined)
            .combined_headers(["x-one", "x-two", "x-three"]);
        let (log, lines) = capture(log);
        exercise(&log, head("/", &[("x-two", "b"), ("x-three", "c")]), Some(Response::text("")));

        let line = lines.lock().unwrap().remove(0);
        let tokens: Vec<&str> = line.split(' ').collect();
        assert_eq!(&tokens[6..8], &["-", "\"b\""]);
        assert_eq!(tokens.len(), 9);
    }

    #[test]
    fn combined_header_keeps_non_ascii_value() {
        let (log, lines) = capture(AccessLog::new().format(LogFormat::ApacheCombined));
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_bytes("Agent/é".as_bytes()).unwrap());
        headers.append("referer", HeaderValue::from_static("https://a.example/"));
        headers.append("referer", HeaderValue::from_static("https://b.example/"));
        let head = RequestHead::new(Method::GET, Uri::from_static("/"), headers);
        exercise(&log, head, Some(Response::text("ok")));

        let line = lines.lock().unwrap().remove(0);
        assert!(
            line.contains(r#" 200 "https://a.example/, https://b.example/" "Agent/é" "#),
            "{line}"
        );
    }

    #[test]
    fn unresolvable_fields_are_dashes() {
        let (log, lines) = capture(AccessLog::new());
        exercise(&log, head("/", &[("x-forwarded-for", "unknown, nope")]), None);

        let line = lines.lock().unwrap().remove(0);
        let tokens: Vec<&str> = line.split(' ').collect();
        assert_eq!(tokens[0], "-");
        assert_eq!(tokens[5], "-");
        assert!(is_duration(tokens[6]));
    }

    #[test]
    fn response_status_used_when_result_has_none() {
        let (log, lines) = capture(AccessLog::new());
        let mut ctx = Context::new(head("/", &[]));
        log.on_pre_request(&mut ctx);
        ctx.response_mut().set_status(StatusCode::IM_A_TEAPOT);
        log.on_post_request(&mut ctx);
        ctx.finish().1.run();

        assert!(lines.lock().unwrap()[0].contains(" 418 "));
    }

    #[test]
    fn response_time_header_matches_logged_duration() {
        let (log, lines) = capture(AccessLog::new().include_duration(true));
        let res = exercise(&log, head("/", &[]), Some(Response::text("ok")));

        let header: f64 = res.headers()["x-response-time"].to_str().unwrap().parse().unwrap();
        let line = lines.lock().unwrap().remove(0);
        let token = line.rsplit(' ').next().unwrap();
        let logged: f64 = token.trim_end_matches("ms").parse().unwrap();
        assert_eq!(header, logged);
    }

    #[test]
    fn response_time_header_absent_by_default() {
        let (log, _lines) = capture(AccessLog::new());
        let res = exercise(&log, head("/", &[]), Some(Response::text("ok")));
        assert!(!res.headers().contains_key("x-response-time"));
    }

    #[test]
    fn line_is_emitted_only_when_deferred_work_runs() {
        let (log, lines) = capture(AccessLog::new().include_duration(true));
        let mut ctx = Context::new(head("/", &[]));
        log.on_pre_request(&mut ctx);
        log.on_post_request(&mut ctx);

        assert!(ctx.response().headers().contains_key("x-response-time"));
        assert!(lines.lock().unwrap().is_empty());

        ctx.finish().1.run();
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_timing_logs_zero_duration() {
        let (log, lines) = capture(AccessLog::new());
        let mut ctx = Context::new(head("/", &[]));
        log.on_post_request(&mut ctx);
        ctx.finish().1.run();

        assert!(lines.lock().unwrap()[0].ends_with(" 0.0ms"));
    }

    #[test]
    fn pre_hook_keeps_sibling_state() {
        let log = AccessLog::new();
        let mut ctx = Context::new(head("/", &[]));
        ctx.state_mut().insert(String::from("request-id"));
        log.on_pre_request(&mut ctx);

        assert_eq!(ctx.state().get::<String>().map(String::as_str), Some("request-id"));
        assert!(ctx.state().get::<Timing>().is_some());

        log.on_post_request(&mut ctx);
        assert!(ctx.state().get::<Timing>().is_none());
        assert!(ctx.state().get::<String>().is_some());
    }

    #[test]
    fn utc_timestamp_format() {
        let log = AccessLog::new().utc_time(true);
        let ts = log.timestamp();
        assert!(ts.ends_with(" +0000]"), "{ts}");
        assert!(DateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok(), "{ts}");
    }

    #[test]
    fn local_timestamp_parses() {
        let ts = AccessLog::new().timestamp();
        assert!(DateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok(), "{ts}");
    }
}
