//! HTTP Download Manager
//!
//! Fetches bundle artifacts with a size cap, a per-attempt timeout and
//! bounded retry with exponential backoff. Bytes are held in memory until the
//! download completes, so a cancelled or failed download never reaches the
//! store.

use futures_util::StreamExt;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::config::DownloadConfig;
use crate::engine::error::{Result, UpdateError};

/// Download result with metadata
#[derive(Debug)]
pub struct DownloadResult {
    pub bytes: Vec<u8>,
    pub attempts: u32,
}

/// Delay before retrying after `attempt` (1-indexed) failed.
/// Exponential, capped, with up to 25% added jitter.
pub fn backoff_delay(config: &DownloadConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = (base as u64).min(config.max_backoff_ms);

    let delay = if config.jitter && capped > 0 {
        capped + rand::rng().random_range(0..=capped / 4)
    } else {
        capped
    };
    Duration::from_millis(delay)
}

/// Download manager for bundle artifacts
pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("LiveUpdate-Engine/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download with retries. Only network failures and timeouts are retried.
    pub async fn download<F>(
        &self,
        url: &str,
        max_size: u64,
        mut on_progress: F,
    ) -> Result<DownloadResult>
    where
        F: FnMut(u64, u64), // (downloaded, total)
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(
                self.config.timeout(),
                self.fetch(url, max_size, &mut on_progress),
            )
            .await
            .unwrap_or_else(|_| {
                Err(UpdateError::Network(format!(
                    "timed out after {}s",
                    self.config.timeout_secs
                )))
            });

            match outcome {
                Ok(bytes) => {
                    debug!(attempt, size = bytes.len(), "Download complete");
                    return Ok(DownloadResult {
                        bytes,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff_delay(&self.config, attempt);
                    warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %e, "Download failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single attempt
    async fn fetch<F>(&self, url: &str, max_size: u64, on_progress: &mut F) -> Result<Vec<u8>>
    where
        F: FnMut(u64, u64),
    {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!("HTTP {}", response.status())));
        }

        let total = response.content_length().unwrap_or(0);
        if total > max_size {
            return Err(UpdateError::size_limit(total, max_size));
        }

        let mut bytes = Vec::with_capacity(total as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len() as u64 + chunk.len() as u64 > max_size {
                return Err(UpdateError::size_limit(
                    bytes.len() as u64 + chunk.len() as u64,
                    max_size,
                ));
            }
            bytes.extend_from_slice(&chunk);
            on_progress(bytes.len() as u64, total);
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = DownloadConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: false,
            ..DownloadConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = DownloadConfig {
            initial_backoff_ms: 400,
            max_backoff_ms: 10_000,
            jitter: true,
            ..DownloadConfig::default()
        };
        for _ in 0..100 {
            let delay = backoff_delay(&config, 1).as_millis();
            assert!((400..=500).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_download_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bundle".to_vec()))
            .mount(&server)
            .await;

        let downloader = Downloader::new(fast_config()).unwrap();
        let mut last = 0;
        let result = downloader
            .download(&format!("{}/bundle", server.uri()), 1024, |done, _| last = done)
            .await
            .unwrap();
        assert_eq!(result.bytes, b"bundle");
        assert_eq!(result.attempts, 1);
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn test_download_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let downloader = Downloader::new(fast_config()).unwrap();
        let result = downloader
            .download(&format!("{}/bundle", server.uri()), 1024, |_, _| {})
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.bytes, b"ok");
    }

    #[tokio::test]
    async fn test_download_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let downloader = Downloader::new(fast_config()).unwrap();
        let result = downloader
            .download(&format!("{}/bundle", server.uri()), 1024, |_, _| {})
            .await;
        assert!(matches!(result, Err(UpdateError::Network(_))));
    }

    #[tokio::test]
    async fn test_size_limit_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .expect(1)
            .mount(&server)
            .await;

        let downloader = Downloader::new(fast_config()).unwrap();
        let result = downloader
            .download(&format!("{}/bundle", server.uri()), 16, |_, _| {})
            .await;
        assert!(matches!(result, Err(UpdateError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let config = DownloadConfig {
            max_attempts: 1,
            timeout_secs: 1,
            ..fast_config()
        };
        let downloader = Downloader::new(config).unwrap();
        let result = downloader
            .download(&format!("{}/bundle", server.uri()), 1024, |_, _| {})
            .await;
        assert!(matches!(result, Err(UpdateError::Network(_))));
    }
}
