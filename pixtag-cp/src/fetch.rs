//! Image Fetcher
//!
//! Downloads image bytes by URL. Failures are per image: the worker skips the
//! image and carries on with the rest of the product.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::FetchError;

/// Raw bytes of a downloaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    /// `Content-Type` header as sent by the host
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, image_link: &str) -> Result<FetchedImage, FetchError>;
}

/// reqwest-backed fetcher with a browser User-Agent and a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Self {
            http_client,
            timeout,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, image_link: &str) -> Result<FetchedImage, FetchError> {
        tracing::debug!(image_link, "Fetching image");

        let response = self
            .http_client
            .get(image_link)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;
        if bytes.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, routing::get, Router};

    async fn spawn_host() -> String {
        let app = Router::new()
            .route(
                "/ok.jpg",
                get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], vec![0xFFu8, 0xD8, 0xFF]) }),
            )
            .route("/missing.jpg", get(|| async { StatusCode::NOT_FOUND }))
            .route("/empty.jpg", get(|| async { Vec::<u8>::new() }))
            .route(
                "/slow.jpg",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fetcher(timeout: Duration) -> HttpImageFetcher {
        HttpImageFetcher::new("pixtag-test", timeout).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let host = spawn_host().await;
        let image = fetcher(Duration::from_secs(5))
            .fetch(&format!("{}/ok.jpg", host))
            .await
            .unwrap();
        assert_eq!(image.bytes, vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(image.content_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_success_and_empty() {
        let host = spawn_host().await;
        let f = fetcher(Duration::from_secs(5));

        assert!(matches!(
            f.fetch(&format!("{}/missing.jpg", host)).await,
            Err(FetchError::Status(404))
        ));
        assert!(matches!(
            f.fetch(&format!("{}/empty.jpg", host)).await,
            Err(FetchError::EmptyBody)
        ));
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let host = spawn_host().await;
        let result = fetcher(Duration::from_millis(100))
            .fetch(&format!("{}/slow.jpg", host))
            .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
