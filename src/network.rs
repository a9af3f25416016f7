//! Network access for the router.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseKind};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Abstraction over the network for testability.
///
/// An `Err` means no response was produced at all (DNS, connect, reset).
/// HTTP error statuses are successful fetches.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs a request.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Builds a configured HTTP client for origin and CDN requests.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
}

/// [`Network`] implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: Url,
}

impl HttpNetwork {
    /// Creates a network with a default client. Responses from `origin` are
    /// tagged [`ResponseKind::Basic`], all others [`ResponseKind::Cors`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(origin: Url) -> Result<Self> {
        Ok(Self::with_client(build_http_client()?, origin))
    }

    /// Creates a network around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, origin: Url) -> Self {
        Self { client, origin }
    }

    fn kind_for(&self, url: &Url) -> ResponseKind {
        if url.origin() == self.origin.origin() {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }
}

fn network_error(url: &Url, err: &reqwest::Error) -> Error {
    Error::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| Error::Network {
                url: request.url.to_string(),
                reason: e.to_string(),
            })?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| network_error(&request.url, &e))?;

        let status = resp.status().as_u16();
        let kind = self.kind_for(resp.url());
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| network_error(&request.url, &e))?;

        log::debug!("[net] {} {} -> {status}", request.method, request.url);

        Ok(Response {
            status,
            headers,
            body,
            kind,
        })
    }
}
