//! Access to the Sysdig Monitor HTTP API.
//!
//! The rest of the crate only talks to the backend through the [`Transport`] trait,
//! which makes it possible to test the batching logic without a network.
//! [`HttpTransport`] is the real implementation.

use serde::de::DeserializeOwned;
use thiserror::Error;

mod client;
pub mod model;

pub use client::{HttpTransport, user_agent_string};

pub use futures::future::BoxFuture;

/// Identity of a configured backend.
///
/// Two datasources with different identities never share cached lookups nor batched requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Base url of the API, without trailing slash.
    pub url: String,
    pub api_token: String,
}

impl Backend {
    pub fn new(url: impl Into<String>, api_token: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end_matches('/').to_owned(),
            api_token: api_token.into(),
        }
    }

    /// Full url of an API path, e.g. `api/data/batch`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// A request to one API endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the backend url.
    pub path: String,
    /// Query string parameters, encoded by the transport.
    pub query: Vec<(String, String)>,
    /// JSON body, only sent with [`Method::Post`].
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Adds a query string parameter.
    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_owned(), value.into()));
        self
    }

    /// Returns the value of a query string parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: serde_json::Value,
}

impl ApiResponse {
    /// Deserializes the response body.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        serde_json::from_value(self.data).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },
    /// The request could not be completed (connection refused, timeout, ...).
    #[error("request failed: {0}")]
    Request(String),
    /// The response body is not what we expected.
    #[error("could not decode response body: {0}")]
    Decode(String),
}

/// Sends requests to a backend.
pub trait Transport: Send + Sync {
    fn send(&self, backend: &Backend, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, backend: &Backend, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>> {
        (**self).send(backend, request)
    }
}
