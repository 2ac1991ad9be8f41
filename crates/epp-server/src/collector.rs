use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use epp_common::{now_ms, EndpointId, EndpointSpec, EndpointsFile};
use epp_scheduler::{EndpointUpdate, PoolRegistry};

use crate::health::Readiness;
use crate::metrics::Metrics;
use crate::scrape::{scrape_engine_load, EngineLoad, ScrapeError};

/// Consecutive scrape failures after which an endpoint is marked unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Where per-endpoint load comes from.
#[async_trait]
pub trait LoadSource: Send + Sync {
    async fn load(&self, endpoint: &EndpointSpec) -> Result<EngineLoad, ScrapeError>;
}

pub struct HttpScraper {
    http: reqwest::Client,
}

impl HttpScraper {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl LoadSource for HttpScraper {
    async fn load(&self, endpoint: &EndpointSpec) -> Result<EngineLoad, ScrapeError> {
        scrape_engine_load(&self.http, &endpoint.metrics_base_url()).await
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub pool: String,
    pub endpoints_file: PathBuf,
    pub interval: Duration,
    pub endpoint_ttl: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub scraped: usize,
    pub failed: usize,
    pub registered: Vec<EndpointId>,
    pub removed: Vec<EndpointId>,
    pub expired: Vec<EndpointId>,
}

pub struct Collector<S> {
    config: CollectorConfig,
    registry: Arc<PoolRegistry>,
    source: S,
    metrics: Arc<Metrics>,
    failures: HashMap<EndpointId, u32>,
}

impl<S: LoadSource> Collector<S> {
    pub fn new(
        config: CollectorConfig,
        registry: Arc<PoolRegistry>,
        source: S,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            metrics,
            failures: HashMap::new(),
        }
    }

    /// One collection pass over `specs`, the full desired membership of the pool.
    pub async fn tick(&mut self, specs: &[EndpointSpec], now_ms: u64) -> TickReport {
        let mut report = TickReport::default();
        let pool = self.config.pool.clone();

        let listed: HashSet<EndpointId> = specs.iter().map(EndpointSpec::id).collect();
        if let Ok(snapshot) = self.registry.snapshot(&pool) {
            for ep in snapshot.endpoints {
                let role_changed = specs
                    .iter()
                    .any(|s| s.id() == ep.id && s.role != ep.role);
                if (!listed.contains(&ep.id) || role_changed) && self.registry.remove(&ep.id) {
                    self.failures.remove(&ep.id);
                    report.removed.push(ep.id);
                }
            }
        }

        let results = join_all(specs.iter().map(|spec| self.source.load(spec))).await;

        for (spec, result) in specs.iter().zip(results) {
            let id = spec.id();
            match result {
                Ok(load) => {
                    report.scraped += 1;
                    self.failures.remove(&id);
                    match self.registry.register_at(&pool, id.clone(), spec.role, now_ms) {
                        Ok(true) => report.registered.push(id.clone()),
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(endpoint = %id, error = %e, "cannot register endpoint");
                            continue;
                        }
                    }
                    let applied = self
                        .registry
                        .update_at(&id, EndpointUpdate::Load(load.total()), now_ms)
                        .and_then(|_| {
                            self.registry
                                .update_at(&id, EndpointUpdate::Health(true), now_ms)
                        });
                    if let Err(e) = applied {
                        tracing::debug!(endpoint = %id, error = %e, "endpoint vanished during update");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics
                        .scrape_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    let failures = self.failures.entry(id.clone()).or_insert(0);
                    *failures += 1;
                    tracing::debug!(endpoint = %id, failures = *failures, error = %e, "scrape failed");
                    if *failures == UNHEALTHY_AFTER_FAILURES {
                        tracing::warn!(endpoint = %id, error = %e, "endpoint marked unhealthy");
                    }
                    if *failures >= UNHEALTHY_AFTER_FAILURES && self.registry.contains(&id) {
                        let _ = self
                            .registry
                            .update_at(&id, EndpointUpdate::Health(false), now_ms);
                    }
                }
            }
        }

        let ttl_ms = self.config.endpoint_ttl.as_millis() as u64;
        report.expired = self.registry.expire_stale(now_ms, ttl_ms);
        for id in &report.expired {
            self.failures.remove(id);
            tracing::warn!(endpoint = %id, ttl_ms, "endpoint expired");
        }
        self.metrics
            .endpoints_expired_total
            .fetch_add(report.expired.len() as u64, Ordering::Relaxed);

        report
    }

    /// Re-read the endpoints file and run a pass every `interval` until cancelled.
    /// A file that fails to load keeps the previous membership.
    pub async fn run(
        mut self,
        readiness: Arc<Readiness>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut specs: Option<Vec<EndpointSpec>> = None;
        loop {
            match load_endpoints_file(&self.config.endpoints_file).await {
                Ok(file) => specs = Some(file.endpoints),
                Err(e) => {
                    tracing::warn!(
                        path = %self.config.endpoints_file.display(),
                        error = %e,
                        "failed to load endpoints file, will retry"
                    );
                }
            }

            if let Some(specs) = specs.as_deref() {
                let report = self.tick(specs, now_ms()).await;
                tracing::debug!(
                    pool = %self.config.pool,
                    scraped = report.scraped,
                    failed = report.failed,
                    registered = report.registered.len(),
                    removed = report.removed.len(),
                    expired = report.expired.len(),
                    "collector pass"
                );
                readiness.mark_synced();
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

pub async fn load_endpoints_file(path: &std::path::Path) -> anyhow::Result<EndpointsFile> {
    let bytes = tokio::fs::read(path).await?;
    Ok(EndpointsFile::parse(&bytes)?)
}
