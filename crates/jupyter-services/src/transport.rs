//! HTTP transport: the pluggable fetch implementation and request helper.
//!
//! Every REST call in this crate goes through [`make_request`], which adds
//! the configured headers and auth token and hands the request to the
//! settings' [`Fetch`] implementation. Nothing here retries; callers decide.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::error::ServiceError;
use crate::settings::ServerSettings;

/// A fully resolved HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Response as seen by the REST clients.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn body_json(&self) -> Result<Value, ServiceError> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| ServiceError::Validation(format!("response body is not JSON: {}", e)))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Method, body and extra headers for one call.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl RequestInit {
    pub fn get() -> Self {
        Self::with_method(Method::GET, None)
    }

    pub fn post(body: Option<Value>) -> Self {
        Self::with_method(Method::POST, body)
    }

    pub fn patch(body: Value) -> Self {
        Self::with_method(Method::PATCH, Some(body))
    }

    pub fn delete() -> Self {
        Self::with_method(Method::DELETE, None)
    }

    fn with_method(method: Method, body: Option<Value>) -> Self {
        Self {
            method,
            body,
            headers: Vec::new(),
        }
    }
}

/// Pluggable HTTP implementation.
///
/// Implementations report transport failures as [`ServiceError::Network`]
/// and return every HTTP status, successful or not, as a response.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError>;
}

/// Default [`Fetch`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for ReqwestFetch {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Send a request with the settings' headers, token and fetch implementation.
pub async fn make_request(
    settings: &ServerSettings,
    url: Url,
    init: RequestInit,
) -> Result<HttpResponse, ServiceError> {
    let mut headers = settings.request_headers();
    headers.extend(init.headers);

    let body = match init.body {
        Some(value) => {
            if find_header(&headers, "content-type").is_none() {
                headers.push(("Content-Type".into(), "application/json".into()));
            }
            Some(value.to_string())
        }
        None => None,
    };

    debug!("[transport] {} {}", init.method, url);
    settings
        .fetch
        .fetch(HttpRequest {
            method: init.method,
            url,
            headers,
            body,
        })
        .await
}
