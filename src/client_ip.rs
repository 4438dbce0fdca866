//! Client address resolution from proxy-chain headers.
//!
//! Behind nginx, a CDN, or a cloud load balancer the socket peer is the proxy,
//! not the client. The client address travels in headers instead, and every
//! vendor picked its own:
//!
//! | Header | Set by |
//! |---|---|
//! | `X-Forwarded-For` | nginx, HAProxy, most L7 balancers (`client, proxy1, proxy2`) |
//! | `CF-Connecting-IP` | Cloudflare |
//! | `DO-Connecting-IP` | DigitalOcean |
//! | `Fastly-Client-IP` | Fastly |
//! | `True-Client-IP` | Akamai, Cloudflare Enterprise |
//! | `X-Real-IP` | nginx `proxy_set_header` convention |
//! | `X-AppEngine-User-IP` | Google App Engine |
//!
//! [`client_ip`] walks them in a fixed order and returns the first value that
//! is a syntactically valid IPv4 or IPv6 literal.
//!
//! ```rust
//! use http::HeaderMap;
//! use tsu_access::client_ip;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert("x-forwarded-for", "unknown, 70.41.3.18".parse().unwrap());
//!
//! assert_eq!(client_ip(&headers), Some("70.41.3.18"));
//! ```

use std::borrow::Cow;
use std::net::IpAddr;
use std::str;

use http::{HeaderMap, HeaderValue};

/// Headers checked, in order, when `X-Forwarded-For` yields nothing.
const FALLBACK_HEADERS: [&str; 11] = [
    "x-client-ip",
    "cf-connecting-ip",
    "do-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
    "x-appengine-user-ip",
];

// ── HeaderSource ──────────────────────────────────────────────────────────────

/// Read-only, case-insensitive header lookup.
///
/// A header may arrive on several lines (proxies often add their own
/// `X-Forwarded-For` line instead of extending the existing one), so the
/// primitive is [`header_lines`](HeaderSource::header_lines).
pub trait HeaderSource {
    /// Raw value of every line named `name`, in the order received.
    fn header_lines(&self, name: &str) -> Vec<&[u8]>;

    /// All lines joined with `", "`. Bytes that are not UTF-8 are replaced
    /// with U+FFFD rather than dropped.
    fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        match self.header_lines(name).as_slice() {
            [] => None,
            [line] => Some(String::from_utf8_lossy(*line)),
            lines => Some(Cow::Owned(
                lines
                    .iter()
                    .map(|line| String::from_utf8_lossy(line))
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    fn has(&self, name: &str) -> bool {
        !self.header_lines(name).is_empty()
    }
}

impl HeaderSource for HeaderMap {
    fn header_lines(&self, name: &str) -> Vec<&[u8]> {
        self.get_all(name).iter().map(HeaderValue::as_bytes).collect()
    }

    fn has(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Returns the most plausible client address, or `None`.
///
/// `X-Forwarded-For` is consulted first (see [`from_forwarded_for`]); repeated
/// lines are read in order, as if joined into one list. A valid entry there
/// ends the search even when other headers are present. Otherwise the vendor
/// headers are checked in a fixed order and each must be a single line holding
/// a bare IP literal.
///
/// # Trust
///
/// The left-most valid `X-Forwarded-For` entry wins. That entry is whatever
/// the client sent, so it can be spoofed. Implementations that need a trusted
/// address scan right-to-left past known proxies instead. This one does not:
/// the value is meant for access logs, not for authorization.
pub fn client_ip<H: HeaderSource + ?Sized>(headers: &H) -> Option<&str> {
    let forwarded = headers
        .header_lines("x-forwarded-for")
        .into_iter()
        .filter_map(|line| str::from_utf8(line).ok())
        .find_map(from_forwarded_for);
    if forwarded.is_some() {
        return forwarded;
    }

    FALLBACK_HEADERS.iter().find_map(|name| match headers.header_lines(name).as_slice() {
        // repeated lines join to `a, b`, which is never a bare address
        [line] => str::from_utf8(*line).ok().filter(|value| is_ip(value)),
        _ => None,
    })
}

/// Picks the first valid address out of an `X-Forwarded-For` value.
///
/// Entries are `client, proxy1, proxy2`. Each is trimmed, and an `ip:port`
/// entry (exactly one colon, as added by Azure App Service) loses its port.
/// IPv6 entries have several colons and pass through untouched. Entries such
/// as `unknown` (Squid's `forwarded_for` directive) simply fail validation.
pub fn from_forwarded_for(value: &str) -> Option<&str> {
    value
        .split(',')
        .map(|entry| strip_port(entry.trim()))
        .find(|candidate| is_ip(candidate))
}

/// `true` if `value` is an IPv4 or IPv6 literal. Purely syntactic.
pub fn is_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

fn strip_port(entry: &str) -> &str {
    match entry.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => entry,
    }
}
