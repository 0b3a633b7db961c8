use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::provider::UpstreamClient;
use crate::quota::QuotaLedger;
use crate::telemetry::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub quota: Arc<QuotaLedger>,
    pub inflight: Arc<Semaphore>,
    pub inflight_count: Arc<AtomicU64>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: Config,
        metrics: Metrics,
        inflight_count: Arc<AtomicU64>,
    ) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config)?;
        let quota = QuotaLedger::new(config.limits.max_calls_per_batch, config.batch_window());
        let inflight = Arc::new(Semaphore::new(config.limits.max_inflight));
        Ok(Self {
            config: Arc::new(config),
            upstream: Arc::new(upstream),
            quota: Arc::new(quota),
            inflight,
            inflight_count,
            metrics,
        })
    }
}

pub struct InflightGuard {
    _permit: OwnedSemaphorePermit,
    counter: Arc<AtomicU64>,
}

impl InflightGuard {
    pub fn new(permit: OwnedSemaphorePermit, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            _permit: permit,
            counter,
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
