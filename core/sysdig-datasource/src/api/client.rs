use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, InvalidHeaderValue};

use super::{ApiRequest, ApiResponse, Backend, BoxFuture, Method, Transport, TransportError};

const PRODUCT_HEADER: &str = "X-Sysdig-Product";

/// Sysdig Monitor API client, based on `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

pub fn user_agent_string() -> String {
    let crate_name = env!("CARGO_PKG_NAME");
    let crate_version = env!("CARGO_PKG_VERSION");
    let user_agent = format!("{crate_name}/{crate_version}");
    log::debug!("Client user agent: {user_agent}");
    user_agent
}

impl HttpTransport {
    /// Creates a new client.
    ///
    /// Without `timeout`, a request that the server never answers stays pending forever.
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = reqwest::ClientBuilder::new().user_agent(user_agent_string());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Request(format!("failed to initialize HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, backend: &Backend, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>> {
        let client = self.client.clone();
        let url = backend.endpoint(&request.path);
        let auth = bearer_header(&backend.api_token);

        Box::pin(async move {
            let auth = auth.map_err(|e| TransportError::Request(format!("api token is not a valid header: {e}")))?;
            let mut builder = match request.method {
                Method::Get => client.get(&url),
                Method::Post => client.post(&url),
            };
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(PRODUCT_HEADER, HeaderValue::from_static("SDC"))
                .header(AUTHORIZATION, auth);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let (Method::Post, Some(body)) = (request.method, &request.body) {
                builder = builder.json(body);
            }
            log::trace!("sending {builder:?}");

            let response = builder
                .send()
                .await
                .map_err(|e| TransportError::Request(format!("could not send request to {url}: {e}")))?;
            log::trace!("got response {response:?}");
            handle_response(response).await
        })
    }
}

async fn handle_response(response: reqwest::Response) -> Result<ApiResponse, TransportError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::Request(format!("failed to read response body for status {status}: {e}")))?;

    if status.is_client_error() || status.is_server_error() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let data = if body.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?
    };
    Ok(ApiResponse {
        status: status.as_u16(),
        data,
    })
}

fn bearer_header(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut header = HeaderValue::from_str(&format!("Bearer {token}"))?;
    header.set_sensitive(true);
    Ok(header)
}
