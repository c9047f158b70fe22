//! Active health checking.
//!
//! A single background task probes every known upstream with a bounded
//! TCP connect on a fixed interval. Probe results only mutate the health
//! table; request dispatch is never blocked by the monitor. Probe errors
//! are swallowed and recorded as DOWN.

use std::sync::Arc;
use std::time::Duration;

use gangway_metrics::ProxyMetrics;
use tokio::net::TcpStream;

use crate::balancer::Balancer;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe rounds.
    pub interval: Duration,
    /// Timeout for each TCP connect probe.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

pub struct HealthMonitor {
    balancer: Arc<Balancer>,
    metrics: Arc<ProxyMetrics>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(balancer: Arc<Balancer>, metrics: Arc<ProxyMetrics>, config: HealthConfig) -> Self {
        Self {
            balancer,
            metrics,
            config,
        }
    }

    /// Starts the monitor task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            self.probe_all().await;
        }
    }

    async fn probe_all(&self) {
        let snapshot = self.balancer.snapshot_services();

        for (service, addrs) in snapshot {
            let probes: Vec<_> = addrs
                .iter()
                .map(|addr| {
                    let addr = addr.clone();
                    let timeout = self.config.probe_timeout;
                    async move {
                        let up = Self::probe(&addr, timeout).await;
                        (addr, up)
                    }
                })
                .collect();

            for (addr, up) in futures::future::join_all(probes).await {
                let changed = self.balancer.record_probe(&addr, up);
                self.metrics
                    .upstream_health
                    .with_label_values(&[&service, &addr])
                    .set(if up { 1 } else { 0 });
                if changed {
                    tracing::info!(
                        service = %service,
                        upstream = %addr,
                        state = if up { "UP" } else { "DOWN" },
                        "health_change"
                    );
                }
            }
        }
    }

    async fn probe(addr: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
