// # Native Bridge
//
// All HTTP traffic goes through `NetFetch`, mirroring the host shell's
// `netFetch(url, options)` call: it never fails, transport problems come
// back inside the response.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("saver/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl NetRequest {
    pub fn get(url: impl Into<String>) -> Self {
        NetRequest {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        NetRequest {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        self
    }
}

/// Result of a bridged HTTP call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetResponse {
    /// True for a 2xx response
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status: Option<u16>,
}

impl NetResponse {
    pub fn ok(data: Value) -> Self {
        NetResponse {
            success: true,
            data: Some(data),
            error: None,
            status: Some(200),
        }
    }

    pub fn http_error(status: u16, data: Option<Value>) -> Self {
        NetResponse {
            success: false,
            data,
            error: Some(format!("HTTP {}", status)),
            status: Some(status),
        }
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        NetResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            status: None,
        }
    }
}

#[async_trait]
pub trait NetFetch: Send + Sync {
    async fn fetch(&self, request: NetRequest) -> NetResponse;
}

/// `NetFetch` over a shared reqwest client
#[derive(Clone)]
pub struct ReqwestNetFetch {
    client: Client,
}

impl ReqwestNetFetch {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestNetFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetFetch for ReqwestNetFetch {
    async fn fetch(&self, request: NetRequest) -> NetResponse {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };

        debug!("{} {}", method, request.url);

        let mut builder = self
            .client
            .request(method, &request.url)
            .header("User-Agent", USER_AGENT);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request to {} failed: {}", request.url, e);
                return NetResponse::transport_error(format!("Network error: {}", e));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return NetResponse {
                    success: false,
                    data: None,
                    error: Some(format!("Failed to read response body: {}", e)),
                    status: Some(status.as_u16()),
                }
            }
        };

        // Empty bodies are valid (e.g. 204), anything else must be JSON
        let data = if text.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    return NetResponse {
                        success: false,
                        data: None,
                        error: Some(format!("Malformed response body: {}", e)),
                        status: Some(status.as_u16()),
                    }
                }
            }
        };

        if status.is_success() {
            NetResponse {
                success: true,
                data,
                error: None,
                status: Some(status.as_u16()),
            }
        } else {
            NetResponse::http_error(status.as_u16(), data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header() {
        let request = NetRequest::get("http://localhost/progress/s1").bearer("abc");
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );
        assert_eq!(request.method, HttpMethod::Get);
        assert!(request.body.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let fetch = ReqwestNetFetch::new();
        // Port 9 (discard) on loopback is expected to refuse connections
        let response = fetch
            .fetch(NetRequest::get("http://127.0.0.1:9/progress/s1"))
            .await;

        assert!(!response.success);
        assert!(response.status.is_none());
        assert!(response.error.unwrap().starts_with("Network error"));
    }
}
