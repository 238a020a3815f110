//! Minimal HTTP request/response model and the client seam used to talk to the gateway.
//!
//! Everything device facing goes through [HttpClient]. [ReqwestClient] is the
//! production implementation; tests plug in scripted clients.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }

    /// Requests which change device state must echo the CSRF token.
    pub fn is_state_changing(&self) -> bool {
        matches!(self, Method::Post)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute url.
    pub url: String,
    /// Path and query; this is the digest `uri`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Path and query as sent on the wire: percent-encoded, dot segments resolved.
pub fn wire_path(base_url: &str, path: &str) -> Result<String> {
    let url = reqwest::Url::parse(&format!("{}{}", base_url, path))
        .with_context(|| format!("invalid request path {}", path))?;
    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    })
}

impl HttpRequest {
    /// The digest `uri` is the normalized path, so it matches what the server sees.
    pub fn new(method: Method, base_url: &str, path: &str) -> Self {
        let path = wire_path(base_url, path).unwrap_or_else(|_| path.to_owned());
        Self {
            method,
            url: format!("{}{}", base_url, path),
            path,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self.with_header("Content-Type", "application/json")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_owned();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with given name (case insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Transport used for every device request.
///
/// Implementations must report delivery problems as errors and any received
/// response (including 4xx/5xx) as `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        log::trace!("{} {}", request.method, request.url);
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Network(format!("{} {}: {}", request.method, request.path, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(format!("reading body of {}: {}", request.path, e)))?;
        log::trace!("{} {} -> {}", request.method, request.path, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn header_lookup_is_case_insensitive() {
        let r = HttpResponse::new(200)
            .with_header("Set-Cookie", "a=1")
            .with_header("set-cookie", "b=2");
        assert_eq!(r.header("SET-COOKIE"), Some("a=1"));
        assert_eq!(r.header_all("set-cookie").count(), 2);
        assert!(r.header("x-missing").is_none());
        assert!(r.is_success());
        assert!(!HttpResponse::new(401).is_success());
    }

    #[test]
    fn request_builder() {
        let r = HttpRequest::new(Method::Post, "http://10.0.0.5:80", "/api/x")
            .with_json(&serde_json::json!({"a": 1}));
        assert_eq!(r.url, "http://10.0.0.5:80/api/x");
        assert_eq!(r.path, "/api/x");
        assert_eq!(r.header("content-type"), Some("application/json"));
        assert_eq!(r.body.as_deref(), Some(r#"{"a":1}"#));
        assert!(r.method.is_state_changing());
        assert!(!Method::Get.is_state_changing());
    }

    #[test]
    fn request_path_is_wire_encoded() {
        let r = HttpRequest::new(Method::Get, "http://gw:80", "/api/x y?a=b c");
        assert_eq!(r.path, "/api/x%20y?a=b%20c");
        assert_eq!(r.url, "http://gw:80/api/x%20y?a=b%20c");
        let parsed = reqwest::Url::parse(&r.url).unwrap();
        assert_eq!(parsed.path(), "/api/x%20y");
        assert_eq!(parsed.query(), Some("a=b%20c"));

        let r = HttpRequest::new(Method::Get, "http://gw:80", "/api/get_system_info");
        assert_eq!(r.path, "/api/get_system_info");
        assert_eq!(HttpRequest::new(Method::Get, "http://gw:80", "/api/../x").path, "/x");
    }

    #[tokio::test]
    async fn reqwest_client_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/set_matrix_route"))
            .and(header("x-csrf-token", "abc"))
            .and(body_string(r#"{"source":"A"}"#))
            .respond_with(ResponseTemplate::new(200).insert_header("X-Reply", "yes").set_body_string("done"))
            .mount(&server)
            .await;

        let client = ReqwestClient::new(Duration::from_secs(2)).unwrap();
        let req = HttpRequest::new(Method::Post, &server.uri(), "/api/set_matrix_route")
            .with_header("X-CSRF-Token", "abc")
            .with_json(&serde_json::json!({"source": "A"}));
        let resp = client.send(req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("x-reply"), Some("yes"));
        assert_eq!(resp.body, "done");
    }

    #[tokio::test]
    async fn reqwest_client_reports_status_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(403))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", testing::CHALLENGE))
            .mount(&server)
            .await;

        let client = ReqwestClient::new(Duration::from_secs(2)).unwrap();
        let resp = client
            .send(HttpRequest::new(Method::Get, &server.uri(), "/api/get_system_info"))
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.header("www-authenticate"), Some(testing::CHALLENGE));

        let resp = client
            .send(HttpRequest::new(Method::Get, &server.uri(), "/api/get_system_info").with_header("Authorization", "x"))
            .await
            .unwrap();
        assert_eq!(resp.status, 403);
    }

    #[tokio::test]
    async fn reqwest_client_network_error_is_typed() {
        let client = ReqwestClient::new(Duration::from_millis(500)).unwrap();
        // port 9 on localhost: nothing listens
        let err = client
            .send(HttpRequest::new(Method::Get, "http://127.0.0.1:9", "/api/get_system_info"))
            .await
            .unwrap_err();
        assert_eq!(
            crate::error::GatewayError::classify(&err),
            crate::error::ErrorKind::Network
        );
    }
}
