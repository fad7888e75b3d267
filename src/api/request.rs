//! Fully buffered request, so it can be inspected and then relayed

use crate::api::response::error_response;
use crate::common::{Error, Result};
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;

use crate::cluster::forward::FORWARDED_HEADER;

#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Decoded value of a query parameter; empty values count as absent
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.uri.query()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key != name {
                return None;
            }
            let value = value.replace('+', " ");
            let value = percent_decode_str(&value).decode_utf8_lossy().into_owned();
            (!value.is_empty()).then_some(value)
        })
    }

    /// `?project=`, defaulting to `default`
    pub fn project(&self) -> String {
        self.query_param("project")
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Relayed here by another member
    pub fn is_forwarded(&self) -> bool {
        self.headers.contains_key(FORWARDED_HEADER)
    }

    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Err(Error::InvalidInput("Request body is empty".into()));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidInput(format!("Invalid request body: {}", e)))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for BufferedRequest {
    type Rejection = Response;

    async fn from_request(req: Request, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
            error_response(&Error::InvalidInput(format!("Failed to read request body: {}", e)))
                .into_response()
        })?;
        Ok(Self::new(parts.method, parts.uri, parts.headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> BufferedRequest {
        BufferedRequest::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn test_query_params() {
        let req = request("/1.0/storage-pools/p/volumes?project=my%20proj&target=node2&recursion=");
        assert_eq!(req.project(), "my proj");
        assert_eq!(req.query_param("target").as_deref(), Some("node2"));
        assert_eq!(req.query_param("recursion"), None);
        assert_eq!(request("/1.0").project(), "default");
    }

    #[test]
    fn test_empty_body_is_invalid() {
        let req = request("/1.0");
        assert!(matches!(
            req.json::<serde_json::Value>(),
            Err(Error::InvalidInput(_))
        ));
    }
}
