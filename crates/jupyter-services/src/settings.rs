//! Connection settings for a Jupyter server.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::ServiceError;
use crate::socket::{SocketFactory, TungsteniteSocketFactory};
use crate::transport::{Fetch, ReqwestFetch};

/// Base URL used when `JUPYTER_BASE_URL` is not set.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8888/";

/// Where the server lives and how to talk to it.
///
/// Constructed once and shared (usually behind an `Arc`) by every REST call,
/// kernel connection and manager that targets the same server.
#[derive(Clone)]
pub struct ServerSettings {
    /// HTTP base URL, always with a trailing slash.
    pub base_url: Url,
    /// WebSocket base URL, always with a trailing slash.
    pub ws_url: Url,
    /// Sent as `Authorization: token <token>`.
    pub token: Option<String>,
    /// Also append `token=` to WebSocket URLs, for servers behind proxies
    /// that drop the upgrade request's headers.
    pub append_token: bool,
    /// Extra headers added to every request.
    pub headers: Vec<(String, String)>,
    pub fetch: Arc<dyn Fetch>,
    pub socket_factory: Arc<dyn SocketFactory>,
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("base_url", &self.base_url.as_str())
            .field("ws_url", &self.ws_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("append_token", &self.append_token)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ServerSettings {
    /// Settings for `base_url` with the default `reqwest` and
    /// `tokio-tungstenite` transports.
    pub fn new(base_url: &str) -> Result<Self, ServiceError> {
        let base_url = normalize(Url::parse(base_url)?)?;
        let ws_url = derive_ws_url(&base_url)?;
        Ok(Self {
            base_url,
            ws_url,
            token: None,
            append_token: false,
            headers: Vec::new(),
            fetch: Arc::new(ReqwestFetch::new()),
            socket_factory: Arc::new(TungsteniteSocketFactory),
        })
    }

    /// Settings from `JUPYTER_BASE_URL`, `JUPYTER_WS_URL` and `JUPYTER_TOKEN`.
    pub fn from_env() -> Result<Self, ServiceError> {
        let base_url = std::env::var("JUPYTER_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut settings = Self::new(&base_url)?;

        if let Ok(ws_url) = std::env::var("JUPYTER_WS_URL") {
            if !ws_url.is_empty() {
                settings = settings.with_ws_url(&ws_url)?;
            }
        }
        if let Ok(token) = std::env::var("JUPYTER_TOKEN") {
            if !token.is_empty() {
                settings = settings.with_token(token);
            }
        }
        Ok(settings)
    }

    pub fn with_ws_url(mut self, ws_url: &str) -> Result<Self, ServiceError> {
        self.ws_url = normalize(Url::parse(ws_url)?)?;
        Ok(self)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_append_token(mut self, append: bool) -> Self {
        self.append_token = append;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<dyn Fetch>) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    /// Custom headers plus the `Authorization` header when a token is set.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let Some(token) = &self.token {
            headers.push(("Authorization".into(), format!("token {}", token)));
        }
        headers
    }

    /// Join path segments onto the base URL, percent-encoding each one.
    pub fn api_url(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        join_segments(&self.base_url, segments)
    }

    /// WebSocket URL for a kernel's channels endpoint.
    pub fn kernel_channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url, ServiceError> {
        let mut url = join_segments(&self.ws_url, &["api", "kernels", kernel_id, "channels"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            if self.append_token {
                if let Some(token) = &self.token {
                    query.append_pair("token", token);
                }
            }
        }
        Ok(url)
    }
}

fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, ServiceError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ServiceError::InvalidUrl(format!("{} cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn normalize(mut url: Url) -> Result<Url, ServiceError> {
    if url.cannot_be_a_base() {
        return Err(ServiceError::InvalidUrl(format!("{} cannot be a base", url)));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn derive_ws_url(base: &Url) -> Result<Url, ServiceError> {
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ServiceError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                other
            )))
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ServiceError::InvalidUrl(format!("cannot derive WebSocket URL from {}", base)))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let settings = ServerSettings::new("http://localhost:8888/lab").unwrap();
        assert_eq!(settings.base_url.as_str(), "http://localhost:8888/lab/");
        assert_eq!(settings.ws_url.as_str(), "ws://localhost:8888/lab/");
    }

    #[test]
    fn test_https_becomes_wss() {
        let settings = ServerSettings::new("https://hub.example.com/user/me/").unwrap();
        assert_eq!(settings.ws_url.scheme(), "wss");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            ServerSettings::new("ftp://example.com/"),
            Err(ServiceError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_api_url_encodes_segments() {
        let settings = ServerSettings::new("http://localhost:8888/base/").unwrap();
        let url = settings.api_url(&["api", "kernels", "a b/c"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8888/base/api/kernels/a%20b%2Fc");
    }

    #[test]
    fn test_kernel_channels_url() {
        let settings = ServerSettings::new("http://localhost:8888/")
            .unwrap()
            .with_token("tok")
            .with_append_token(true);
        let url = settings.kernel_channels_url("k1", "client-1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8888/api/kernels/k1/channels?session_id=client-1&token=tok"
        );
    }

    #[test]
    fn test_token_header() {
        let settings = ServerSettings::new(DEFAULT_BASE_URL)
            .unwrap()
            .with_token("abc");
        let headers = settings.request_headers();
        assert!(headers.contains(&("Authorization".to_string(), "token abc".to_string())));
        assert!(!format!("{:?}", settings).contains("abc"));
    }
}
