//! Connection classification by peeking the first bytes of a TCP stream.
//!
//! HTTP/1.x starts with a method token, HTTP/2 prior knowledge starts with
//! the `PRI` preface, and a TLS handshake starts with a record-type byte.
//! The peeked bytes stay in the socket buffer, so whichever protocol stack
//! is chosen sees the original stream.

/// HTTP/1.1 method tokens.
pub const HTTP1_METHODS: &[&str] = &[
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT",
];

/// HTTP/2 prior-knowledge preface token.
pub const HTTP2_METHODS: &[&str] = &["PRI"];

/// TLS record types that open a handshake.
const TLS_RECORD_HANDSHAKE: u8 = 0x16;
const SSL2_RECORD_HIGH_BIT: u8 = 0x80;

/// Protocol spoken by an incoming connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Tls,
    Unknown,
}

/// Longest token across the supplied method lists; the peek window must
/// cover it plus the following space.
#[must_use]
pub fn longest_token(method_lists: &[&[&str]]) -> usize {
    method_lists
        .iter()
        .flat_map(|list| list.iter())
        .map(|token| token.len())
        .max()
        .unwrap_or(0)
}

/// How many bytes to peek from an accepted connection.
#[must_use]
pub fn peek_len() -> usize {
    longest_token(&[HTTP1_METHODS, HTTP2_METHODS]) + 1
}

/// Classify a connection from its first bytes.
#[must_use]
pub fn classify(prefix: &[u8]) -> Protocol {
    let Some(&first) = prefix.first() else {
        return Protocol::Unknown;
    };
    if first == TLS_RECORD_HANDSHAKE || first & SSL2_RECORD_HIGH_BIT != 0 {
        return Protocol::Tls;
    }
    let Ok(text) = std::str::from_utf8(prefix) else {
        return Protocol::Unknown;
    };
    for method in HTTP2_METHODS {
        if text.starts_with(&format!("{method} ")) {
            return Protocol::Http2;
        }
    }
    for method in HTTP1_METHODS {
        if text.starts_with(&format!("{method} ")) {
            return Protocol::Http1;
        }
    }
    Protocol::Unknown
}

/// The raw 301 answer sent to plaintext clients hitting a TLS listener.
#[must_use]
pub fn https_redirect_response(host: &str) -> String {
    format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: https://{host}/\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http1_methods() {
        for req in [
            "GET / HTTP/1.1\r\n",
            "PUT /bucket/key HTTP/1.1\r\n",
            "DELETE /bucket HTTP/1.1\r\n",
            "OPTIONS * HTTP/1.1\r\n",
        ] {
            assert_eq!(classify(req.as_bytes()), Protocol::Http1, "{req}");
        }
    }

    #[test]
    fn classifies_http2_preface() {
        assert_eq!(classify(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"), Protocol::Http2);
    }

    #[test]
    fn classifies_tls_handshake() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x02, 0x00]), Protocol::Tls);
        // SSLv2-style record length with the high bit set.
        assert_eq!(classify(&[0x80, 0x2e, 0x01]), Protocol::Tls);
    }

    #[test]
    fn unknown_otherwise() {
        assert_eq!(classify(b""), Protocol::Unknown);
        assert_eq!(classify(b"NONSENSE xyz"), Protocol::Unknown);
        // A method token without its trailing space is not yet HTTP.
        assert_eq!(classify(b"GETX"), Protocol::Unknown);
    }

    #[test]
    fn peek_window_covers_longest_token() {
        assert_eq!(longest_token(&[HTTP1_METHODS, HTTP2_METHODS]), 7);
        assert_eq!(peek_len(), 8);
        assert_eq!(longest_token(&[]), 0);
    }

    #[test]
    fn redirect_response_shape() {
        let resp = https_redirect_response("example.com:443");
        assert!(resp.starts_with("HTTP/1.1 301"));
        assert!(resp.contains("Location: https://example.com:443/"));
    }
}
