use crate::error::{ServerError, ServerResult};
use std::collections::HashMap;
use std::io::{self, Write};
use std::str;

/// HTTP status codes the file server and its binary produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    NotModified = 304,
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    InternalServerError = 500,
}

impl Status {
    /// Get the reason phrase for this status code
    pub fn as_str(&self) -> &'static str {
        match *self {
            Status::Ok => "OK",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalServerError => "Internal Server Error",
        }
    }

    /// Numeric status code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Whether a response with this status may carry a body
    pub fn allows_body(&self) -> bool {
        !matches!(self, Status::NotModified)
    }
}

/// HTTP Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    /// Parse a method from a string
    pub fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "PATCH" => Ok(Method::Patch),
            _ => Err(ServerError::HttpParse(format!("Invalid method: {}", s))),
        }
    }

    /// Convert the method to a string
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }
}

/// Parse a request head (request line plus headers).
///
/// Returns `Ok(None)` while the blank line terminating the head has not
/// arrived yet. Bodies are ignored; the file server only answers GET/HEAD.
pub fn parse_request_head(data: &[u8]) -> ServerResult<Option<Request>> {
    let end = match data.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => end,
        None => return Ok(None),
    };

    let head = str::from_utf8(&data[..end])
        .map_err(|_| ServerError::HttpParse("Invalid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ServerError::HttpParse("Invalid request line".to_string()));
    }

    let method = Method::from_str(parts[0])?;
    let mut request = Request::new(method, parts[1]);

    for line in lines.filter(|l| !l.is_empty()) {
        let colon = line
            .find(':')
            .ok_or_else(|| ServerError::HttpParse("Invalid header".to_string()))?;
        request.set_header(line[..colon].trim(), line[colon + 1..].trim());
    }

    Ok(Some(request))
}

/// HTTP Request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    /// Header names are stored lowercased
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: HashMap::new(),
        }
    }

    /// Set a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_lowercase(), value.to_string());
    }

    /// Get a header
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_lowercase())
    }

    /// The request target without its query string
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri,
        }
    }
}

/// HTTP Response.
///
/// Headers keep the casing they were set with and are looked up
/// case-insensitively. The body is written through `io::Write` until
/// [`Response::end`] is called.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    finished: bool,
}

impl Response {
    /// Create a new response with an implicit 200 status
    pub fn new() -> Self {
        Self {
            status: Status::Ok,
            headers: HashMap::new(),
            body: Vec::new(),
            finished: false,
        }
    }

    /// Set a header, replacing any existing value regardless of casing
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// Get a header
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Write the status code
    pub fn write_head(&mut self, status: Status) {
        self.status = status;
    }

    /// Terminate the response; later body writes are rejected
    pub fn end(&mut self) {
        self.finished = true;
    }

    /// Whether [`Response::end`] has been called
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Serialize the response, leaving out the body when `include_body` is false
    pub fn serialize<W: Write>(&self, writer: &mut W, include_body: bool) -> io::Result<()> {
        write!(writer, "HTTP/1.1 {} {}\r\n", self.status.code(), self.status.as_str())?;

        for (name, value) in &self.headers {
            write!(writer, "{}: {}\r\n", name, value)?;
        }

        if self.status.allows_body() {
            write!(writer, "Content-Length: {}\r\n", self.body.len())?;
        }
        write!(writer, "Connection: close\r\n\r\n")?;

        if include_body && self.status.allows_body() {
            writer.write_all(&self.body)?;
        }

        Ok(())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after end",
            ));
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incomplete_head() {
        let parsed = parse_request_head(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_head_with_headers() {
        let data = b"GET /index.html?v=2 HTTP/1.1\r\nHost: example.com\r\nIf-None-Match: abc\r\n\r\n";
        let request = parse_request_head(data).unwrap().unwrap();

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.uri, "/index.html?v=2");
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.get_header("if-none-match").unwrap(), "abc");
        assert_eq!(request.get_header("Host").unwrap(), "example.com");
    }

    #[test]
    fn test_parse_rejects_bad_request_line() {
        assert!(parse_request_head(b"GET\r\n\r\n").is_err());
        assert!(parse_request_head(b"BREW /pot HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_header_replacement_ignores_case() {
        let mut response = Response::new();
        response.set_header("content-type", "text/plain");
        response.set_header("Content-Type", "text/html");

        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.get_header("CONTENT-TYPE").unwrap(), "text/html");
    }

    #[test]
    fn test_write_after_end_fails() {
        let mut response = Response::new();
        response.write_all(b"hello").unwrap();
        response.end();

        assert!(response.write_all(b" world").is_err());
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_not_modified_serializes_without_body() {
        let mut response = Response::new();
        response.set_header("ETag", "abc");
        response.write_head(Status::NotModified);
        response.end();

        let mut buffer = Vec::new();
        response.serialize(&mut buffer, true).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(text.contains("ETag: abc\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_head_serialization_keeps_length() {
        let mut response = Response::new();
        response.write_all(b"Hello, World!").unwrap();

        let mut buffer = Vec::new();
        response.serialize(&mut buffer, false).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
