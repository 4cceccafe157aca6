// HTTP/1.1 request-line parser — RFC 9112, first token and URI only.
//
// The profiles only discriminate on the request method and target, so the
// parser stops after the URI; headers and bodies never reach a policy
// predicate.

use super::HttpMethod;

/// Default HTTP port; a recognized method on any other destination port is
/// still treated as a response.
const HTTP_PORT: u16 = 80;

/// A classified HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub is_request: bool,
    pub method: HttpMethod,
    pub uri: Option<String>,
}

/// Classify the method token at the start of `data`, returning the method
/// and the offset just past the token's trailing space.
fn parse_method(data: &[u8]) -> (HttpMethod, usize) {
    // Each token length includes the separating space, so the returned
    // offset lands on the first URI byte.
    let (method, token_len) = match data.first() {
        Some(b'G') => (HttpMethod::Get, 4),
        Some(b'H') => (HttpMethod::Head, 5),
        Some(b'P') => match data.get(1) {
            Some(b'O') => (HttpMethod::Post, 5),
            Some(b'U') => (HttpMethod::Put, 4),
            _ => (HttpMethod::Unknown, 0),
        },
        Some(b'D') => (HttpMethod::Delete, 7),
        Some(b'C') => (HttpMethod::Connect, 8),
        Some(b'O') => (HttpMethod::Options, 8),
        Some(b'T') => (HttpMethod::Trace, 6),
        _ => (HttpMethod::Unknown, 0),
    };
    (method, token_len)
}

/// True if the payload starts with a recognized HTTP method token.
pub fn is_http(data: &[u8]) -> bool {
    parse_method(data).0 != HttpMethod::Unknown
}

/// Bytes after the method token up to the first space.
fn parse_uri(data: &[u8], offset: usize) -> String {
    let rest = data.get(offset..).unwrap_or(&[]);
    let end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

/// Parse an HTTP message from a TCP payload.
///
/// The message is a request iff the destination port is 80 and the first
/// token is a recognized method; anything else is a response with method
/// `Unknown` and no URI.
pub fn parse(data: &[u8], dst_port: u16) -> HttpMessage {
    let (method, offset) = parse_method(data);
    let is_request = dst_port == HTTP_PORT && method != HttpMethod::Unknown;
    if is_request {
        HttpMessage {
            is_request,
            method,
            uri: Some(parse_uri(data, offset)),
        }
    } else {
        HttpMessage {
            is_request: false,
            method: HttpMethod::Unknown,
            uri: None,
        }
    }
}

impl std::fmt::Display for HttpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_request {
            write!(f, "HTTP request {} {}", self.method, self.uri.as_deref().unwrap_or(""))
        } else {
            write!(f, "HTTP response")
        }
    }
}
