use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
}

/// One reachability check against the workload's public endpoint.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Treats any successful HTTP response from the endpoint as ready.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpReadinessProbe {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %self.url, %status, "Readiness probe answered.");
                status.is_success()
            }
            Err(e) => {
                let details = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                };
                debug!(url = %self.url, error = %details, "Readiness probe failed.");
                false
            }
        }
    }
}

/// Polls `probe` every `interval` until it succeeds or `max_wait` has elapsed.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    max_wait: Duration,
    interval: Duration,
) -> Readiness {
    let deadline = Instant::now() + max_wait;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        // A slow probe must not stretch the deadline.
        let answered = tokio::time::timeout_at(deadline, probe.is_ready()).await;
        if matches!(answered, Ok(true)) {
            info!(attempts, "Workload endpoint is ready.");
            return Readiness::Ready;
        }

        let now = Instant::now();
        if answered.is_err() || now >= deadline {
            warn!(attempts, max_wait_secs = max_wait.as_secs(), "Workload endpoint never became ready.");
            return Readiness::Timeout;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
