//! Data model for captured traffic
//!
//! Defines the exchange record, the filter predicate used by the query
//! surface, the wire-level failure classification, and the event payloads
//! broadcast to consumers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header map captured off the wire. Duplicate header names collapse to the
/// last value sent.
pub type Headers = HashMap<String, String>;

/// Pseudo-header recorded when a captured body exceeded the capture cap.
pub const TRUNCATED_HEADER: &str = "x-netlens-truncated";

/// Pseudo-header carrying the failure classification of an exchange.
pub const ERROR_KIND_HEADER: &str = "x-netlens-error";

/// One captured HTTP request/response pair.
///
/// Created when a complete request head arrives, updated exactly once when
/// the response completes (or the exchange fails), immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Monotonically increasing archive id, assigned at insert.
    pub id: i64,
    /// Wall-clock milliseconds at request-head arrival.
    pub timestamp_ms: i64,
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Authority component of `url`.
    pub host: String,
    /// Path including the query string.
    pub path: String,
    /// HTTP status; 0 while no response has been recorded.
    pub status: u16,
    pub request_headers: Headers,
    pub request_body: Option<Vec<u8>>,
    pub response_headers: Headers,
    pub response_body: Option<Vec<u8>>,
    /// Lowercased response `Content-Type`, parameter segments retained.
    pub content_type: Option<String>,
    pub duration_ms: i64,
    /// Stored response body length.
    pub size_bytes: i64,
}

/// Request-side fields handed to the archive when an exchange opens.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub timestamp_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub request_headers: Headers,
    pub request_body: Option<Vec<u8>>,
}

/// Response-side fields recorded when an exchange closes out.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: u16,
    pub response_headers: Headers,
    pub response_body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub duration_ms: i64,
}

impl Exchange {
    /// The view of a freshly opened exchange, before any response fields
    /// exist. Mirrors what `get_by_id` returns for a pending row.
    pub fn from_open(id: i64, open: &OpenRequest) -> Self {
        Self {
            id,
            timestamp_ms: open.timestamp_ms,
            method: open.method.clone(),
            url: open.url.clone(),
            host: open.host.clone(),
            path: open.path.clone(),
            status: 0,
            request_headers: open.request_headers.clone(),
            request_body: open.request_body.clone(),
            response_headers: Headers::new(),
            response_body: None,
            content_type: None,
            duration_ms: 0,
            size_bytes: 0,
        }
    }
}

/// Derive the stored `content_type` from a response header map: the verbatim
/// `Content-Type` value, lowercased, parameters retained.
pub fn content_type_of(response_headers: &Headers) -> Option<String> {
    response_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.to_ascii_lowercase())
}

/// Status-code bucket expanded to an inclusive range for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusBucket {
    #[serde(rename = "2xx")]
    Success,
    #[serde(rename = "3xx")]
    Redirect,
    #[serde(rename = "4xx")]
    ClientError,
    #[serde(rename = "5xx")]
    ServerError,
}

impl StatusBucket {
    pub fn range(self) -> (u16, u16) {
        match self {
            StatusBucket::Success => (200, 299),
            StatusBucket::Redirect => (300, 399),
            StatusBucket::ClientError => (400, 499),
            StatusBucket::ServerError => (500, 599),
        }
    }
}

/// Query predicate over the archive. All populated fields apply
/// conjunctively; empty sets match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeFilter {
    /// Case-insensitive substring matched against `url`, `host`, and `path`.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub status_buckets: Vec<StatusBucket>,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Substrings matched case-insensitively against `content_type`.
    #[serde(default)]
    pub content_types: Vec<String>,
    /// Inclusive lower bound on `timestamp_ms`.
    #[serde(default)]
    pub since_ms: Option<i64>,
    /// Inclusive upper bound on `timestamp_ms`.
    #[serde(default)]
    pub until_ms: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Classification of a failed (or soft-failed) exchange, surfaced in
/// `RequestFailed` events and the `x-netlens-error` pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    DnsFailure,
    UpstreamConnect,
    UpstreamTls,
    UpstreamProtocol,
    ClientDisconnect,
    ClientTls,
    Timeout,
    /// Soft: the capture was truncated, the exchange itself succeeded.
    TruncatedBody,
    StoreWrite,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DnsFailure => "DNS_FAILURE",
            ErrorKind::UpstreamConnect => "UPSTREAM_CONNECT",
            ErrorKind::UpstreamTls => "UPSTREAM_TLS",
            ErrorKind::UpstreamProtocol => "UPSTREAM_PROTOCOL",
            ErrorKind::ClientDisconnect => "CLIENT_DISCONNECT",
            ErrorKind::ClientTls => "CLIENT_TLS",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::TruncatedBody => "TRUNCATED_BODY",
            ErrorKind::StoreWrite => "STORE_WRITE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-lifecycle events broadcast to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProxyEvent {
    RequestStarted { id: i64, exchange: Exchange },
    RequestCompleted { id: i64, exchange: Exchange },
    RequestFailed { id: i64, error: ErrorKind },
    /// Inserted on a subscriber's stream in place of events it was too slow
    /// to receive.
    Lag { dropped: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ranges_cover_each_class() {
        assert_eq!(StatusBucket::Success.range(), (200, 299));
        assert_eq!(StatusBucket::Redirect.range(), (300, 399));
        assert_eq!(StatusBucket::ClientError.range(), (400, 499));
        assert_eq!(StatusBucket::ServerError.range(), (500, 599));
    }

    #[test]
    fn error_kind_strings_are_stable() {
        assert_eq!(ErrorKind::DnsFailure.as_str(), "DNS_FAILURE");
        assert_eq!(ErrorKind::UpstreamConnect.as_str(), "UPSTREAM_CONNECT");
        assert_eq!(ErrorKind::ClientDisconnect.as_str(), "CLIENT_DISCONNECT");
        assert_eq!(
            serde_json::to_string(&ErrorKind::UpstreamTls).unwrap(),
            "\"UPSTREAM_TLS\""
        );
    }

    #[test]
    fn content_type_is_lowercased_with_parameters() {
        let mut headers = Headers::new();
        headers.insert(
            "Content-Type".to_string(),
            "Application/JSON; charset=UTF-8".to_string(),
        );
        assert_eq!(
            content_type_of(&headers).as_deref(),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(content_type_of(&Headers::new()), None);
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let ev = ProxyEvent::RequestFailed {
            id: 7,
            error: ErrorKind::Timeout,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"RequestFailed\""));
        assert!(json.contains("\"error\":\"TIMEOUT\""));
    }

    #[test]
    fn open_view_has_no_response_fields() {
        let open = OpenRequest {
            timestamp_ms: 1,
            method: "GET".to_string(),
            url: "http://example.test/".to_string(),
            host: "example.test".to_string(),
            path: "/".to_string(),
            request_headers: Headers::new(),
            request_body: None,
        };
        let view = Exchange::from_open(42, &open);
        assert_eq!(view.id, 42);
        assert_eq!(view.status, 0);
        assert!(view.response_headers.is_empty());
        assert_eq!(view.size_bytes, 0);
    }
}
