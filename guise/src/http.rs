//! The HTTP decoy exchanged right after the TCP handshake.
//!
//! Inspection boxes that expect HTTP framing see one request/response pair
//! before opaque data starts flowing. Neither side parses the other's
//! bytes beyond the shape check: at least [`SHAPE_MIN_LEN`] bytes, a fixed
//! 4-byte prefix, and a terminating blank line.

/// Minimum payload length for a segment to count as a decoy message.
pub const SHAPE_MIN_LEN: usize = 20;

/// Builds the decoy request. With a configured host the request carries
/// both `Host:` and `X-Online-Host:` headers.
pub fn build_request(host: Option<&str>) -> String {
    let mut headers = String::new();
    if let Some(host) = host {
        headers.push_str(&format!("Host: {host}\r\nX-Online-Host: {host}\r\n"));
    }
    format!(
        "POST / HTTP/1.1\r\n\
         {headers}\
         User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64)\r\n\
         Content-Type: application/octet-stream\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )
}

/// Builds the decoy response.
pub fn build_response() -> String {
    "HTTP/1.1 200 OK\r\n\
     Server: nginx\r\n\
     Content-Type: application/octet-stream\r\n\
     Transfer-Encoding: chunked\r\n\
     Connection: keep-alive\r\n\
     \r\n"
        .to_string()
}

/// Whether a payload has the decoy-request shape.
pub fn is_request_shaped(payload: &[u8]) -> bool {
    payload.len() >= SHAPE_MIN_LEN
        && payload.starts_with(b"POST")
        && payload.ends_with(b"\r\n\r\n")
}

/// Whether a payload has the decoy-response shape.
pub fn is_response_shaped(payload: &[u8]) -> bool {
    payload.len() >= SHAPE_MIN_LEN
        && payload.starts_with(b"HTTP")
        && payload.ends_with(b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_request_shaped() {
        let req = build_request(None);
        assert!(is_request_shaped(req.as_bytes()));
        assert!(!is_response_shaped(req.as_bytes()));
    }

    #[test]
    fn request_with_host_carries_both_headers() {
        let req = build_request(Some("cdn.example.com"));
        assert!(req.contains("Host: cdn.example.com\r\n"));
        assert!(req.contains("X-Online-Host: cdn.example.com\r\n"));
        assert!(is_request_shaped(req.as_bytes()));
    }

    #[test]
    fn response_is_response_shaped() {
        let rep = build_response();
        assert!(is_response_shaped(rep.as_bytes()));
        assert!(!is_request_shaped(rep.as_bytes()));
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert!(!is_request_shaped(b"POST /\r\n\r\n"));
        assert!(!is_response_shaped(b"HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn shape_checks_only_look_at_edges() {
        let fake = b"POST garbage not a real request at all\r\n\r\n";
        assert!(is_request_shaped(fake));
        let fake = b"HTTP nonsense with arbitrary middle bytes\r\n\r\n";
        assert!(is_response_shaped(fake));
    }
}
