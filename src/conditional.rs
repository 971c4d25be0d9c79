use crate::error::{ServerError, ServerResult};
use crate::fs::FileMetadata;
use crate::http::{Request, Response, Status};

/// Length of the hex entity tag
const TAG_LEN: usize = 32;

/// Deterministic entity tag for a file name and modification time
pub fn entity_tag(file_name: &str, modified_at_millis: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_name.as_bytes());
    hasher.update(modified_at_millis.to_string().as_bytes());
    hasher.finalize().to_hex()[..TAG_LEN].to_string()
}

/// What the response should do after conditional evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// 304 has been written and the response ended
    NotModified,
    /// Empty file: headers are set and the response ended
    Empty,
    /// Headers are set; the body still has to be delivered
    Deliver,
}

/// Per-request inputs to the evaluator
#[derive(Debug, Clone, Copy)]
pub struct Representation<'a> {
    /// Name the tag is computed from (the pre-negotiation name)
    pub file_name: &'a str,
    pub mime_type: &'a str,
    pub max_age: u64,
    pub content_encoding: Option<&'static str>,
}

/// Decide whether the request can be answered without a body.
///
/// ETag and Cache-Control are always set before the decision so that a 304
/// carries them too.
pub fn evaluate(
    metadata: &FileMetadata,
    representation: &Representation<'_>,
    request: &Request,
    response: &mut Response,
) -> ServerResult<Freshness> {
    if !metadata.is_regular_file {
        return Err(ServerError::not_found(representation.file_name));
    }

    let tag = entity_tag(representation.file_name, metadata.modified_at_millis);

    response.set_header("ETag", &tag);
    response.set_header(
        "Cache-Control",
        &format!("private, max-age={}", representation.max_age),
    );

    if request.get_header("if-none-match").map(String::as_str) == Some(tag.as_str()) {
        response.write_head(Status::NotModified);
        response.end();
        return Ok(Freshness::NotModified);
    }

    response.set_header("Content-Type", representation.mime_type);
    if let Some(encoding) = representation.content_encoding {
        response.set_header("Content-Encoding", encoding);
    }

    if metadata.size == 0 {
        response.end();
        return Ok(Freshness::Empty);
    }

    Ok(Freshness::Deliver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn metadata(size: u64) -> FileMetadata {
        FileMetadata {
            is_regular_file: true,
            size,
            modified_at_millis: 1_234,
        }
    }

    fn representation(max_age: u64) -> Representation<'static> {
        Representation {
            file_name: "./foo.txt",
            mime_type: "bar",
            max_age,
            content_encoding: None,
        }
    }

    #[test]
    fn test_entity_tag_is_deterministic() {
        assert_eq!(entity_tag("./foo.txt", 1_234), entity_tag("./foo.txt", 1_234));
        assert_ne!(entity_tag("./foo.txt", 1_234), entity_tag("./foo.txt", 1_235));
        assert_ne!(entity_tag("./foo.txt", 1_234), entity_tag("./bar.txt", 1_234));
        assert_eq!(entity_tag("./foo.txt", 1_234).len(), TAG_LEN);
    }

    #[test]
    fn test_fresh_request_sets_headers() {
        let request = Request::new(Method::Get, "/");
        let mut response = Response::new();

        let outcome = evaluate(&metadata(10), &representation(123), &request, &mut response).unwrap();

        assert_eq!(outcome, Freshness::Deliver);
        assert_eq!(response.get_header("ETag").unwrap(), &entity_tag("./foo.txt", 1_234));
        assert_eq!(response.get_header("Cache-Control").unwrap(), "private, max-age=123");
        assert_eq!(response.get_header("Content-Type").unwrap(), "bar");
        assert!(response.get_header("Content-Encoding").is_none());
        assert!(!response.is_finished());
    }

    #[test]
    fn test_matching_tag_is_not_modified() {
        let mut request = Request::new(Method::Get, "/");
        request.set_header("If-None-Match", &entity_tag("./foo.txt", 1_234));
        let mut response = Response::new();

        let outcome = evaluate(&metadata(10), &representation(0), &request, &mut response).unwrap();

        assert_eq!(outcome, Freshness::NotModified);
        assert_eq!(response.status, Status::NotModified);
        assert!(response.is_finished());
        assert!(response.body.is_empty());
        assert!(response.get_header("ETag").is_some());
        assert!(response.get_header("Content-Type").is_none());
    }

    #[test]
    fn test_stale_tag_delivers() {
        let mut request = Request::new(Method::Get, "/");
        request.set_header("If-None-Match", "something-else");
        let mut response = Response::new();

        let outcome = evaluate(&metadata(10), &representation(0), &request, &mut response).unwrap();
        assert_eq!(outcome, Freshness::Deliver);
        assert_eq!(response.status, Status::Ok);
    }

    #[test]
    fn test_empty_file_ends_immediately() {
        let request = Request::new(Method::Get, "/");
        let mut response = Response::new();

        let outcome = evaluate(&metadata(0), &representation(0), &request, &mut response).unwrap();

        assert_eq!(outcome, Freshness::Empty);
        assert_eq!(response.status, Status::Ok);
        assert!(response.is_finished());
        assert_eq!(response.get_header("Content-Type").unwrap(), "bar");
    }

    #[test]
    fn test_encoding_header_for_variant() {
        let request = Request::new(Method::Get, "/");
        let mut response = Response::new();
        let mut representation = representation(0);
        representation.content_encoding = Some("gzip");

        evaluate(&metadata(10), &representation, &request, &mut response).unwrap();
        assert_eq!(response.get_header("Content-Encoding").unwrap(), "gzip");
    }

    #[test]
    fn test_directory_is_not_found() {
        let request = Request::new(Method::Get, "/");
        let mut response = Response::new();
        let mut metadata = metadata(4096);
        metadata.is_regular_file = false;

        let error = evaluate(&metadata, &representation(0), &request, &mut response).unwrap_err();

        assert_eq!(error.code(), Some(404));
        assert_eq!(error.to_string(), "404: Not Found ./foo.txt");
        assert!(response.headers.is_empty());
    }
}
