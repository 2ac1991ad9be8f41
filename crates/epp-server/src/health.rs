use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

use epp_scheduler::PoolRegistry;

/// Ready once the collector finished its first pass and the pool has at least
/// one healthy endpoint.
#[derive(Debug, Default)]
pub struct Readiness {
    synced: AtomicBool,
}

impl Readiness {
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::Relaxed) {
            tracing::info!("initial endpoint sync completed");
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self, registry: &PoolRegistry, pool: &str) -> bool {
        self.is_synced()
            && registry
                .snapshot(pool)
                .map(|s| s.healthy_count() > 0)
                .unwrap_or(false)
    }
}

fn serving_status(ready: bool) -> ServingStatus {
    if ready {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

/// Mirror readiness into the gRPC health service, both for the overall
/// server ("") and for the ext_proc service name.
pub async fn readiness_loop(
    readiness: Arc<Readiness>,
    registry: Arc<PoolRegistry>,
    pool: String,
    mut reporter: HealthReporter,
    service_name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut last: Option<bool> = None;
    loop {
        let ready = readiness.is_ready(&registry, &pool);
        if last != Some(ready) {
            reporter.set_service_status("", serving_status(ready)).await;
            reporter
                .set_service_status(service_name, serving_status(ready))
                .await;
            tracing::info!(pool = %pool, ready, "health status changed");
            last = Some(ready);
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use epp_common::{EndpointId, EndpointRole};
    use epp_scheduler::EndpointUpdate;

    use super::*;

    #[test]
    fn test_ready_needs_sync_and_healthy_endpoint() {
        let registry = PoolRegistry::new();
        registry.declare_pool("p");
        let readiness = Readiness::default();
        assert!(!readiness.is_ready(&registry, "p"));

        readiness.mark_synced();
        assert!(!readiness.is_ready(&registry, "p"));

        let id = EndpointId::from("a:1");
        registry.register("p", id.clone(), EndpointRole::Unified).unwrap();
        assert!(readiness.is_ready(&registry, "p"));
        assert!(!readiness.is_ready(&registry, "other"));

        registry.update(&id, EndpointUpdate::Health(false)).unwrap();
        assert!(!readiness.is_ready(&registry, "p"));
    }
}
