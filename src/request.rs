//! Inbound request boundary
//!
//! The filter pipeline consumes a framework-neutral [`InboundRequest`].
//! Header names are stored lowercased so lookups are case-insensitive.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::AUTHORIZATION;
use hyper::{Method, Request};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use thiserror::Error;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Request conversion errors
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Header '{0}' must not be repeated")]
    DuplicateHeader(String),
}

/// One inbound request as seen by the pipeline
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Create a request with no headers, query, or body
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header (name is lowercased)
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    /// Add an `Authorization: Bearer <token>` header
    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {}", token))
    }

    /// Set the raw query string (without the leading `?`)
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Get a decoded query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query
            .as_deref()
            .and_then(|query| find_urlencoded(query, name))
    }

    /// Get a decoded form field, if the body is `application/x-www-form-urlencoded`
    pub fn form_field(&self, name: &str) -> Option<String> {
        let content_type = self.header("content-type")?;
        let media_type = content_type.split(';').next().unwrap_or("").trim();
        if !media_type.eq_ignore_ascii_case(FORM_CONTENT_TYPE) {
            return None;
        }
        let body = std::str::from_utf8(&self.body).ok()?;
        find_urlencoded(body, name)
    }

    /// Build an inbound request from a hyper request, collecting its body
    ///
    /// A request carrying more than one `Authorization` header is rejected.
    pub async fn from_hyper<B>(req: Request<B>) -> Result<Self, RequestError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        // Two credentials in one request are ambiguous
        if parts.headers.get_all(AUTHORIZATION).iter().count() > 1 {
            return Err(RequestError::DuplicateHeader(AUTHORIZATION.to_string()));
        }

        // Other repeated headers keep their first value
        let mut headers = HashMap::new();
        for (name, value) in parts.headers.iter() {
            if let Ok(v) = value.to_str() {
                headers
                    .entry(name.as_str().to_lowercase())
                    .or_insert_with(|| v.to_string());
            }
        }

        let body = body
            .collect()
            .await
            .map_err(|e| RequestError::Body(e.to_string()))?
            .to_bytes();

        Ok(Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(|q| q.to_string()),
            headers,
            body,
        })
    }
}

/// Find and decode one key in an `application/x-www-form-urlencoded` string
fn find_urlencoded(encoded: &str, name: &str) -> Option<String> {
    encoded.split('&').find_map(|pair| {
        let mut kv = pair.splitn(2, '=');
        let key = decode_component(kv.next()?);
        if key == name {
            Some(decode_component(kv.next().unwrap_or("")))
        } else {
            None
        }
    })
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}
