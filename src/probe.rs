use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::ProbeConfig;
use crate::error::MachinaError;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a TCP endpoint until it accepts a connection or the deadline passes.
#[derive(Debug, Clone)]
pub struct Prober {
    port: u16,
    interval: Duration,
    timeout: Duration,
    attempt_timeout: Duration,
}

impl Prober {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            port: config.port,
            interval: config.interval(),
            timeout: config.timeout(),
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn attempt(&self, address: &str, budget: Duration) -> bool {
        let limit = budget.min(self.attempt_timeout);
        matches!(
            tokio::time::timeout(limit, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }

    /// Wait for `host` to accept connections. The deadline is measured from
    /// the first attempt; no single wait runs past it.
    pub async fn wait(&self, name: &str, host: &str) -> Result<(), MachinaError> {
        let address = format!("{host}:{}", self.port);
        let deadline = Instant::now() + self.timeout;
        tracing::debug!(machine = %name, address = %address, "waiting for machine");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.attempt(&address, remaining).await {
                tracing::info!(machine = %name, address = %address, "machine reachable");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MachinaError::Timeout {
                    name: name.into(),
                    address,
                });
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A localhost port with nothing listening.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_host_times_out_after_deadline() {
        let prober = Prober::new(&ProbeConfig::default()).with_port(closed_port());
        let start = Instant::now();
        let err = prober.wait("web", "127.0.0.1").await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_secs(300), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(302), "returned after {elapsed:?}");
    }

    #[tokio::test]
    async fn listening_host_is_ready_immediately() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = Prober::new(&ProbeConfig::default()).with_port(port);

        let start = std::time::Instant::now();
        prober.wait("web", "127.0.0.1").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn short_timeout_is_honoured() {
        let config = ProbeConfig {
            timeout_s: 3,
            interval_s: 1,
            port: closed_port(),
        };
        let start = Instant::now();
        let err = Prober::new(&config).wait("db", "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, MachinaError::Timeout { ref name, .. } if name == "db"));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
