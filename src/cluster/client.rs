//! HTTP client for talking to other members

use crate::api::request::BufferedRequest;
use crate::cluster::db::MemberRecord;
use crate::cluster::forward::FORWARDED_HEADER;
use crate::cluster::tls;
use crate::common::{Error, Result};
use crate::operations::OperationView;
use axum::http::header;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Clone)]
pub struct MemberClient {
    http: reqwest::Client,
    local: String,
}

impl MemberClient {
    /// `certificate` pins the cluster certificate for https members
    pub fn new(local: impl Into<String>, certificate: Option<&str>, connect_timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
        if let Some(pem) = certificate {
            builder = builder.use_preconfigured_tls(tls::pinned_config(pem)?);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build member client: {}", e)))?;
        Ok(Self {
            http,
            local: local.into(),
        })
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    /// Replay `req` on `member` and return its raw response
    pub async fn send(&self, member: &MemberRecord, req: &BufferedRequest) -> Result<reqwest::Response> {
        let mut headers = req.headers.clone();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONNECTION);
        if let Ok(value) = self.local.parse() {
            headers.insert(FORWARDED_HEADER, value);
        }

        self.http
            .request(req.method.clone(), Self::url(&member.url, req.path_and_query()))
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| Error::unavailable(&member.name, e))
    }

    /// POST a JSON body to another member and return the response envelope.
    /// Error envelopes become errors with the remote status.
    pub async fn post_json<T: Serialize>(
        &self,
        member: &MemberRecord,
        path: &str,
        body: &T,
        authorization: Option<&str>,
    ) -> Result<Value> {
        let mut request = self
            .http
            .post(Self::url(&member.url, path))
            .header(FORWARDED_HEADER, self.local.as_str())
            .json(body);
        if let Some(auth) = authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Error::unavailable(&member.name, e))?;
        Self::envelope(&member.name, resp).await
    }

    /// Block until a remote operation finishes
    pub async fn wait_operation(
        &self,
        member: &MemberRecord,
        operation: &str,
        timeout: Duration,
        authorization: Option<&str>,
    ) -> Result<OperationView> {
        let path = format!("{}/wait?timeout={}", operation, timeout.as_secs());
        let mut request = self
            .http
            .get(Self::url(&member.url, &path))
            .header(FORWARDED_HEADER, self.local.as_str())
            .timeout(timeout + Duration::from_secs(10));
        if let Some(auth) = authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Error::unavailable(&member.name, e))?;
        let envelope = Self::envelope(&member.name, resp).await?;
        serde_json::from_value(envelope["metadata"].clone())
            .map_err(|e| Error::Http(format!("Malformed operation from {}: {}", member.name, e)))
    }

    /// Liveness probe against `/1.0`
    pub async fn ping(&self, member: &MemberRecord) -> Result<()> {
        let resp = self
            .http
            .get(Self::url(&member.url, "/1.0"))
            .header(FORWARDED_HEADER, self.local.as_str())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::unavailable(&member.name, e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::unavailable(&member.name, resp.status()))
        }
    }

    async fn envelope(member: &str, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("Malformed response from {}: {}", member, e)))?;
        if status.is_success() {
            return Ok(body);
        }
        let message = body["error"].as_str().unwrap_or("unknown error").to_string();
        Err(match status.as_u16() {
            400 => Error::InvalidInput(message),
            401 => Error::Unauthorized(message),
            403 => Error::Forbidden(message),
            404 => Error::NotFound(message),
            409 => Error::Conflict(message),
            412 => Error::PreconditionFailed(message),
            503 => Error::unavailable(member, message),
            _ => Error::Http(format!("{} returned {}: {}", member, status, message)),
        })
    }
}
