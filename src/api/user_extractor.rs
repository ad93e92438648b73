use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};

/// Name recorded as committer when the request does not identify its user
pub const ANONYMOUS_COMMITTER: &str = "anonymous";

/// Who is making a change, taken from request headers:
/// - X-User-Id: user identifier
/// - X-User-Name: optional display name, preferred when present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Committer
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(committer_from_headers(&parts.headers))
    }
}

fn committer_from_headers(headers: &HeaderMap) -> Committer {
    let name = extract_header_value(headers, "x-user-name")
        .or_else(|| extract_header_value(headers, "x-user-id"))
        .unwrap_or_else(|| ANONYMOUS_COMMITTER.to_string());
    Committer(name)
}

/// Extract header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn test_committer_prefers_display_name() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-user-id"),
            HeaderValue::from_static("u-123"),
        );
        assert_eq!(committer_from_headers(&headers), Committer("u-123".to_string()));

        headers.insert(
            HeaderName::from_static("x-user-name"),
            HeaderValue::from_static("Alice"),
        );
        assert_eq!(committer_from_headers(&headers), Committer("Alice".to_string()));
    }

    #[test]
    fn test_missing_headers_are_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(
            committer_from_headers(&headers),
            Committer(ANONYMOUS_COMMITTER.to_string())
        );
    }
}
