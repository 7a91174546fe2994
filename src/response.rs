use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::util::{content_type_charset, decode_charset, header_value};

/// A fully buffered HTTP response. Returned for any status; callers
/// inspect `status` separately from the body.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
    default_charset: Option<String>,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
        default_charset: Option<String>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            default_charset,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Response headers in wire order, names as received.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First matching header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decodes the body using the response Content-Type charset, the
    /// charset declared on the request, or UTF-8, in that order.
    pub fn text(&self) -> String {
        let charset = self
            .header("content-type")
            .and_then(content_type_charset)
            .or_else(|| self.default_charset.clone())
            .unwrap_or_else(|| "utf-8".to_owned());
        decode_charset(&self.body, &charset)
    }

    /// Typed decode through the serialization glue: `None` on an empty
    /// body or a parse failure, never a raw parse error.
    pub fn json<T>(&self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        crate::json::from_json(&self.text())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::Response;

    fn response_with(headers: Vec<(String, String)>, body: &[u8]) -> Response {
        Response::new(StatusCode::OK, headers, Bytes::copy_from_slice(body), None)
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = response_with(
            vec![("X-Request-Id".to_owned(), "r-7".to_owned())],
            b"{}",
        );
        assert_eq!(response.header("x-request-id"), Some("r-7"));
        assert_eq!(response.headers()[0].0, "X-Request-Id");
    }

    #[test]
    fn text_honors_content_type_charset() {
        let response = response_with(
            vec![(
                "Content-Type".to_owned(),
                "text/plain; charset=ISO-8859-1".to_owned(),
            )],
            &[0x63, 0x61, 0x66, 0xE9],
        );
        assert_eq!(response.text(), "café");
    }

    #[test]
    fn json_decode_failure_is_none() {
        let response = response_with(Vec::new(), b"not json");
        let decoded: Option<serde_json::Value> = response.json();
        assert!(decoded.is_none());
    }
}
