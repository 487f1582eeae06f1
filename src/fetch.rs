//! Page fetching boundary.
//!
//! The pipeline only ever talks to [`Fetcher`]; the default HTTP
//! implementation lives behind the `http-fetch` feature so embedders of
//! this crate can substitute a browser-automation capture layer instead.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use url::Url;

use crate::normalize::PageSnapshot;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    #[diagnostic(code(pagewright::fetch::request))]
    Request { url: String, message: String },

    #[error("{url} answered with status {status}")]
    #[diagnostic(code(pagewright::fetch::status))]
    Status { url: String, status: u16 },

    #[error("response body from {url} could not be read: {message}")]
    #[diagnostic(code(pagewright::fetch::body))]
    Body { url: String, message: String },
}

/// External collaborator that captures a page snapshot for a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<PageSnapshot, FetchError>;
}

#[cfg(feature = "http-fetch")]
pub use http::HttpFetcher;

#[cfg(feature = "http-fetch")]
mod http {
    use super::*;
    use std::time::Duration;

    /// Plain HTTP fetcher over rustls.
    #[derive(Debug, Clone)]
    pub struct HttpFetcher {
        client: reqwest::Client,
    }

    impl HttpFetcher {
        pub fn new() -> Result<Self, FetchError> {
            let client = reqwest::Client::builder()
                .user_agent(concat!("pagewright/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(30))
                .use_rustls_tls()
                .build()
                .map_err(|e| FetchError::Request {
                    url: String::new(),
                    message: e.to_string(),
                })?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Fetcher for HttpFetcher {
        async fn fetch(&self, url: &Url) -> Result<PageSnapshot, FetchError> {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| FetchError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response.text().await.map_err(|e| FetchError::Body {
                url: url.to_string(),
                message: e.to_string(),
            })?;

            Ok(PageSnapshot::new(url.to_string()).with_html(body))
        }
    }
}
