use axum::http::HeaderName;
use once_cell::sync::Lazy;

// Hop-by-hop headers, valid for a single transport hop only. Stripped from
// every outbound request regardless of what the client sent.
// http://www.w3.org/Protocols/rfc2616/rfc2616-sec13.html
pub static HOP_HEADERS: Lazy<[HeaderName; 8]> = Lazy::new(|| {
    [
        HeaderName::from_static("connection"),
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        HeaderName::from_static("transfer-encoding"),
        HeaderName::from_static("upgrade"),
    ]
});

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub static X_FORWARDED_SERVER: HeaderName = HeaderName::from_static("x-forwarded-server");

// Standard dial and read timeouts, used whenever the configured value is zero.
pub const DEFAULT_HTTP_READ_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HTTP_DIAL_TIMEOUT_SECS: u64 = 10;

// Largest request payload the failover buffer will hold.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

// Round-robin cursors that have not been touched for this long are eligible
// for garbage collection.
pub const DEFAULT_CURSOR_TTL_SECS: i64 = 60;

pub const DEFAULT_LISTEN_PORT: u16 = 8100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_headers_cover_connection_management() {
        let names: Vec<&str> = HOP_HEADERS.iter().map(|h| h.as_str()).collect();
        assert!(names.contains(&"connection"));
        assert!(names.contains(&"transfer-encoding"));
        assert!(names.contains(&"upgrade"));
        assert_eq!(names.len(), 8);
    }
}
