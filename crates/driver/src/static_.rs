//! Static driver: one pre-existing worker endpoint shared by all sessions.

use std::time::Duration;

use async_trait::async_trait;

use wg_domain::Result;

use crate::{probe_health, wait_until_healthy, Driver, Endpoint};

pub struct StaticDriver {
    endpoint: Endpoint,
    readiness_timeout: Duration,
    http: reqwest::Client,
}

impl StaticDriver {
    pub fn new(url: String, readiness_timeout: Duration) -> Self {
        let url = url.trim_end_matches('/').to_owned();
        Self {
            endpoint: Endpoint {
                url,
                container_id: "static".to_owned(),
            },
            readiness_timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for StaticDriver {
    async fn acquire(&self, session_id: &str) -> Result<Endpoint> {
        wait_until_healthy(&self.http, &self.endpoint.url, self.readiness_timeout).await?;
        tracing::debug!(session_id, url = %self.endpoint.url, "static endpoint acquired");
        Ok(self.endpoint.clone())
    }

    async fn release(&self, _session_id: &str) -> Result<()> {
        // The static worker is not ours to stop.
        Ok(())
    }

    async fn health(&self, endpoint: &Endpoint) -> bool {
        probe_health(&self.http, &endpoint.url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let driver = StaticDriver::new("http://worker:8080/".into(), Duration::from_secs(1));
        assert_eq!(driver.endpoint.url, "http://worker:8080");
        assert_eq!(driver.endpoint.container_id, "static");
    }
}
