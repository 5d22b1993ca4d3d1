//! Inner HTTP/1.1 messages carried inside encrypted frames

use crate::domain::Tee3Error;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};

const MAX_HEADERS: usize = 64;

/// An inner request
#[derive(Debug, Clone)]
pub struct InnerRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InnerRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header, ignoring values that are not valid header text
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serializes the request for `host`
    pub fn encode(&self, host: &str) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.path, host)
            .into_bytes();
        write_headers(&mut out, &self.headers, self.body.len());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a complete request; trailing bytes are an error
    pub fn parse(bytes: &[u8]) -> Result<Self, Tee3Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let head_len = match request.parse(bytes) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(Tee3Error::StreamTruncated(
                    "inner request head incomplete".to_string(),
                ))
            }
            Err(e) => return Err(Tee3Error::Protocol(format!("malformed inner request: {e}"))),
        };

        let method = request
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| Tee3Error::Protocol("inner request has no method".to_string()))?;
        let path = request
            .path
            .ok_or_else(|| Tee3Error::Protocol("inner request has no path".to_string()))?
            .to_string();
        let headers = collect_headers(request.headers)?;
        let body = take_body(&headers, &bytes[head_len..])?;

        Ok(Self {
            method,
            path,
            headers,
            body,
        })
    }
}

/// An inner response
#[derive(Debug, Clone)]
pub struct InnerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InnerResponse {
    pub fn new(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// JSON response
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status, value.to_string().into_bytes());
        response.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        write_headers(&mut out, &self.headers, self.body.len());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a complete response
    ///
    /// A body shorter than `Content-Length` is [`Tee3Error::StreamTruncated`],
    /// bytes after the body are [`Tee3Error::ExtraBytesInDecryptedResponse`].
    pub fn parse(bytes: &[u8]) -> Result<Self, Tee3Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let head_len = match response.parse(bytes) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(Tee3Error::StreamTruncated(
                    "inner response head incomplete".to_string(),
                ))
            }
            Err(e) => return Err(Tee3Error::Protocol(format!("malformed inner response: {e}"))),
        };

        let status = response
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| Tee3Error::Protocol("inner response has no status".to_string()))?;
        let headers = collect_headers(response.headers)?;
        let body = take_body(&headers, &bytes[head_len..])?;

        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, body_len: usize) {
    for (name, value) in headers {
        if name == CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {body_len}\r\n\r\n").as_bytes());
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, Tee3Error> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Tee3Error::Protocol(format!("invalid inner header name: {e}")))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| Tee3Error::Protocol(format!("invalid inner header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn take_body(headers: &HeaderMap, rest: &[u8]) -> Result<Vec<u8>, Tee3Error> {
    let length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| Tee3Error::Protocol("invalid inner Content-Length".to_string()))?,
        None => 0,
    };
    match rest.len().cmp(&length) {
        std::cmp::Ordering::Less => Err(Tee3Error::StreamTruncated(format!(
            "inner body has {} of {} bytes",
            rest.len(),
            length
        ))),
        std::cmp::Ordering::Greater => Err(Tee3Error::ExtraBytesInDecryptedResponse),
        std::cmp::Ordering::Equal => Ok(rest.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let request = InnerRequest::new(Method::POST, "/epa/medication/api/v1/fhir/$provide-prescription-erp")
            .header("x-insurantid", "X123456789")
            .body(b"{}".to_vec());
        let encoded = String::from_utf8(request.encode("epa.example")).unwrap();

        assert!(encoded.starts_with(
            "POST /epa/medication/api/v1/fhir/$provide-prescription-erp HTTP/1.1\r\nHost: epa.example\r\n"
        ));
        assert!(encoded.contains("x-insurantid: X123456789\r\n"));
        assert!(encoded.ends_with("Content-Length: 2\r\n\r\n{}"));

        let parsed = InnerRequest::parse(encoded.as_bytes()).unwrap();
        assert_eq!(parsed.method, Method::POST);
        assert_eq!(parsed.headers["x-insurantid"], "X123456789");
        assert_eq!(parsed.body, b"{}");
    }

    #[test]
    fn test_response_parse() {
        let bytes = b"HTTP/1.1 201 Created\r\nContent-Type: application/fhir+json\r\nContent-Length: 4\r\n\r\nbody";
        let response = InnerResponse::parse(bytes).unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, b"body");
    }

    #[test]
    fn test_response_without_content_length_has_empty_body() {
        let response = InnerResponse::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA";
        assert_eq!(
            InnerResponse::parse(bytes).unwrap_err(),
            Tee3Error::ExtraBytesInDecryptedResponse
        );
    }

    #[test]
    fn test_short_body_is_truncation() {
        let bytes = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nok";
        assert!(matches!(
            InnerResponse::parse(bytes),
            Err(Tee3Error::StreamTruncated(_))
        ));
        assert!(matches!(
            InnerResponse::parse(b"HTTP/1.1 200 OK\r\nContent-"),
            Err(Tee3Error::StreamTruncated(_))
        ));
    }
}
