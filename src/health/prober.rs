//! Liveness probes
//!
//! The HTTP probe sends a HEAD request first. Servers that reject HEAD
//! (405/501), drop the connection or let it hang get a second chance with a
//! ranged GET for the first few bytes of the stream. HEAD only gets half of
//! the request budget so the GET still fits inside the per-probe timeout.

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Method, StatusCode};
use std::time::{Duration, Instant};
use tracing::trace;

use super::state::ProbeOutcome;
use crate::config::EngineConfig;
use crate::errors::{ProbeError, ProbeResult};
use crate::utils::UrlUtils;

/// Checks whether a stream URL currently answers
///
/// Implementations report failures through [`ProbeOutcome::Failed`]; the
/// caller applies the per-probe timeout.
#[async_trait]
pub trait StreamProbe: Send + Sync {
    async fn probe(&self, stream_url: &str) -> ProbeOutcome;
}

/// Status codes accepted as proof of life
pub fn is_alive_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 206 | 301 | 302)
}

fn needs_get_fallback(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    )
}

/// HEAD, falling back to a ranged partial GET
pub struct HttpStreamProbe {
    client: reqwest::Client,
    request_timeout: Duration,
    partial_get_bytes: u64,
}

impl HttpStreamProbe {
    /// Redirects are not followed: a 301/302 already counts as alive
    pub fn new(request_timeout: Duration, partial_get_bytes: u64) -> ProbeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProbeError::connection)?;

        Ok(Self::with_client(client, request_timeout, partial_get_bytes))
    }

    pub fn from_config(config: &EngineConfig) -> ProbeResult<Self> {
        Self::new(config.health_check_timeout, config.partial_get_bytes)
    }

    pub fn with_client(
        client: reqwest::Client,
        request_timeout: Duration,
        partial_get_bytes: u64,
    ) -> Self {
        Self {
            client,
            request_timeout,
            partial_get_bytes: partial_get_bytes.max(1),
        }
    }

    async fn head(&self, stream_url: &str) -> Result<StatusCode, reqwest::Error> {
        self.client
            .request(Method::HEAD, stream_url)
            .timeout(self.request_timeout / 2)
            .send()
            .await
            .map(|response| response.status())
    }

    async fn partial_get(
        &self,
        stream_url: &str,
        budget: Duration,
    ) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .client
            .get(stream_url)
            .timeout(budget)
            .header(RANGE, format!("bytes=0-{}", self.partial_get_bytes - 1))
            .send()
            .await?;
        // headers are enough; the body is dropped unread
        Ok(response.status())
    }
}

fn classify(status: StatusCode, started: Instant) -> ProbeOutcome {
    if is_alive_status(status) {
        ProbeOutcome::Alive {
            status: status.as_u16(),
            response_time: started.elapsed(),
        }
    } else {
        ProbeOutcome::Failed {
            error: ProbeError::HttpStatus {
                status: status.as_u16(),
            },
            response_time: Some(started.elapsed()),
        }
    }
}

#[async_trait]
impl StreamProbe for HttpStreamProbe {
    async fn probe(&self, stream_url: &str) -> ProbeOutcome {
        let started = Instant::now();

        let head = self.head(stream_url).await;
        let fallback = match &head {
            Ok(status) => needs_get_fallback(*status),
            Err(_) => true,
        };

        if !fallback {
            return match head {
                Ok(status) => classify(status, started),
                Err(e) => ProbeOutcome::Failed {
                    error: ProbeError::connection(e),
                    response_time: Some(started.elapsed()),
                },
            };
        }

        trace!(
            "HEAD not usable for {}, trying partial GET",
            UrlUtils::obfuscate_credentials(stream_url)
        );

        let budget = self.request_timeout.saturating_sub(started.elapsed());
        match self.partial_get(stream_url, budget).await {
            Ok(status) => classify(status, started),
            Err(e) if e.is_timeout() => ProbeOutcome::Failed {
                error: ProbeError::Timeout {
                    timeout: started.elapsed(),
                },
                response_time: Some(started.elapsed()),
            },
            Err(e) => ProbeOutcome::Failed {
                error: ProbeError::connection(e),
                response_time: Some(started.elapsed()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_alive_statuses() {
        assert!(is_alive_status(StatusCode::OK));
        assert!(is_alive_status(StatusCode::PARTIAL_CONTENT));
        assert!(is_alive_status(StatusCode::FOUND));
        assert!(is_alive_status(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_alive_status(StatusCode::NOT_FOUND));
        assert!(!is_alive_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_get_fallback_statuses() {
        assert!(needs_get_fallback(StatusCode::METHOD_NOT_ALLOWED));
        assert!(needs_get_fallback(StatusCode::NOT_IMPLEMENTED));
        assert!(!needs_get_fallback(StatusCode::NOT_FOUND));
    }

    /// Serves one connection per thread: HEAD never gets an answer, GET gets 206
    fn spawn_head_hanging_server() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    let n = conn.read(&mut buf).unwrap_or(0);
                    if buf[..n].starts_with(b"HEAD") {
                        std::thread::sleep(Duration::from_secs(5));
                        return;
                    }
                    let _ = conn.write_all(
                        b"HTTP/1.1 206 Partial Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    );
                });
            }
        });
        format!("http://{addr}/live.ts")
    }

    #[tokio::test]
    async fn test_hanging_head_falls_back_to_get_within_budget() {
        let url = spawn_head_hanging_server();
        let timeout = Duration::from_secs(1);
        let probe = HttpStreamProbe::new(timeout, 1024).unwrap();

        let outcome = tokio::time::timeout(timeout, probe.probe(&url))
            .await
            .expect("probe finished inside the per-probe timeout");
        match outcome {
            ProbeOutcome::Alive { status, .. } => assert_eq!(status, 206),
            other => panic!("expected alive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        let probe = HttpStreamProbe::new(Duration::from_secs(2), 1024).unwrap();
        let outcome = probe.probe("http://127.0.0.1:9/live.ts").await;
        assert!(!outcome.is_alive());
    }
}
