use std::sync::Arc;

use epp_common::EndpointRole;

pub mod classifier;
pub mod picker;
pub mod registry;
pub mod tokenizer;

pub use classifier::{ClassifierConfig, HeaderFeatures, RequestClassifier, RequestContext};
pub use picker::{Pick, PickerConfig, Rationale, RoutingDecision};
pub use registry::{
    EndpointUpdate, EndpointView, PoolRegistry, PoolSnapshot, RegistryError, Reservation,
};
pub use tokenizer::{tokenizer_from_name, TokenCounter, TokenizerError};

/// A reservation can lose a race with endpoint removal; re-pick this many times.
const MAX_PICK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Configuration or identity mismatch; will not self-correct.
    #[error("pool '{0}' not found")]
    PoolNotFound(String),
    /// Pool exists but nothing can take the request right now.
    #[error("no endpoint available in pool '{pool}' ({healthy}/{total} healthy)")]
    NoCapacity {
        pool: String,
        healthy: usize,
        total: usize,
    },
}

impl ScheduleError {
    pub fn retryable(&self) -> bool {
        match self {
            ScheduleError::PoolNotFound(_) => false,
            ScheduleError::NoCapacity { .. } => true,
        }
    }
}

/// A pick plus the speculative load it placed on the endpoint.
#[derive(Debug)]
pub struct ScheduledRoute {
    pub pick: Pick,
    pub reservation: Reservation,
}

impl ScheduledRoute {
    pub fn is_disaggregated(&self) -> bool {
        self.pick.role == EndpointRole::Prefill
    }
}

pub struct Scheduler {
    registry: Arc<PoolRegistry>,
    picker: PickerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("picker", &self.picker)
            .finish()
    }
}

impl Scheduler {
    pub fn new(registry: Arc<PoolRegistry>, picker: PickerConfig) -> Arc<Self> {
        tracing::info!(
            saturation_load = ?picker.saturation_load,
            approximate_headroom = picker.approximate_headroom,
            "scheduler initialized"
        );
        Arc::new(Self { registry, picker })
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Snapshot `pool`, pick an endpoint for `ctx` and reserve load on it.
    pub fn schedule(
        &self,
        pool: &str,
        ctx: &RequestContext,
    ) -> Result<ScheduledRoute, ScheduleError> {
        let mut last = (0, 0);
        for _ in 0..MAX_PICK_ATTEMPTS {
            let snapshot = self
                .registry
                .snapshot(pool)
                .map_err(|_| ScheduleError::PoolNotFound(pool.to_string()))?;

            match picker::pick(&snapshot, ctx, &self.picker) {
                RoutingDecision::Selected(pick) => {
                    if let Some(reservation) = self.registry.reserve(&pick.endpoint) {
                        tracing::debug!(
                            request_id = %ctx.request_id,
                            endpoint = %pick.endpoint,
                            role = %pick.role,
                            load = pick.load,
                            rationale = pick.rationale.as_str(),
                            "endpoint picked"
                        );
                        return Ok(ScheduledRoute { pick, reservation });
                    }
                    last = (snapshot.healthy_count(), snapshot.endpoints.len());
                    tracing::debug!(endpoint = %pick.endpoint, "picked endpoint vanished, retrying");
                }
                RoutingDecision::NoEndpointAvailable { healthy, total } => {
                    return Err(ScheduleError::NoCapacity {
                        pool: pool.to_string(),
                        healthy,
                        total,
                    });
                }
            }
        }

        Err(ScheduleError::NoCapacity {
            pool: pool.to_string(),
            healthy: last.0,
            total: last.1,
        })
    }
}
