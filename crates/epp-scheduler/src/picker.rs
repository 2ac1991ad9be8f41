use epp_common::{EndpointId, EndpointRole};

use crate::classifier::RequestContext;
use crate::registry::{EndpointView, PoolSnapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PickerConfig {
    /// Load at which an endpoint counts as saturated. `None` disables the check.
    pub saturation_load: Option<u64>,
    /// Extra load assumed for requests whose prompt length is approximate.
    pub approximate_headroom: u64,
}

/// Why a candidate set was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rationale {
    /// Picked among endpoints of the role the request asked for.
    RoleMatch,
    /// No healthy endpoint had the wanted role; picked among the wider healthy set.
    Fallback,
}

impl Rationale {
    pub fn as_str(self) -> &'static str {
        match self {
            Rationale::RoleMatch => "role_match",
            Rationale::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub endpoint: EndpointId,
    pub role: EndpointRole,
    /// Effective load of the endpoint at decision time.
    pub load: u64,
    pub rationale: Rationale,
    /// The chosen endpoint is at or past the saturation load (approximate
    /// requests count `approximate_headroom` extra). Every other candidate was
    /// at least as loaded.
    pub saturated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    Selected(Pick),
    NoEndpointAvailable { healthy: usize, total: usize },
}

/// Role the request should be served by, given what the pool offers.
pub fn required_role(snapshot: &PoolSnapshot, ctx: &RequestContext) -> RoleFilter {
    let has_prefill = snapshot
        .endpoints
        .iter()
        .any(|e| e.role == EndpointRole::Prefill);
    if ctx.disaggregation_eligible && has_prefill {
        RoleFilter::Prefill
    } else {
        RoleFilter::DecodeOrUnified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    Prefill,
    DecodeOrUnified,
}

impl RoleFilter {
    fn accepts(self, role: EndpointRole) -> bool {
        match self {
            RoleFilter::Prefill => role == EndpointRole::Prefill,
            RoleFilter::DecodeOrUnified => role != EndpointRole::Prefill,
        }
    }
}

/// Pure selection over a snapshot: role filter, single fallback to the healthy
/// endpoints the request may use, then least effective load with ties broken
/// by ascending endpoint id. Prefill-only endpoints are never a target for a
/// request that is not split-eligible.
pub fn pick(
    snapshot: &PoolSnapshot,
    ctx: &RequestContext,
    config: &PickerConfig,
) -> RoutingDecision {
    let healthy: Vec<&EndpointView> = snapshot.endpoints.iter().filter(|e| e.healthy).collect();
    let role = required_role(snapshot, ctx);

    let matching: Vec<&EndpointView> = healthy
        .iter()
        .copied()
        .filter(|e| role.accepts(e.role))
        .collect();

    let (candidates, rationale) = if !matching.is_empty() {
        (matching, Rationale::RoleMatch)
    } else {
        let allowed: Vec<&EndpointView> = healthy
            .iter()
            .copied()
            .filter(|e| ctx.disaggregation_eligible || e.role != EndpointRole::Prefill)
            .collect();
        (allowed, Rationale::Fallback)
    };

    let Some(ep) = least_loaded(&candidates) else {
        return RoutingDecision::NoEndpointAvailable {
            healthy: healthy.len(),
            total: snapshot.endpoints.len(),
        };
    };

    let headroom = if ctx.approximate {
        config.approximate_headroom
    } else {
        0
    };
    let saturated = config
        .saturation_load
        .is_some_and(|limit| ep.load().saturating_add(headroom) >= limit);

    RoutingDecision::Selected(Pick {
        endpoint: ep.id.clone(),
        role: ep.role,
        load: ep.load(),
        rationale,
        saturated,
    })
}

fn least_loaded<'a>(candidates: &[&'a EndpointView]) -> Option<&'a EndpointView> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.id.cmp(&b.id)))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn ep(addr: &str, role: EndpointRole, load: u64, healthy: bool) -> EndpointView {
        EndpointView {
            id: EndpointId::from(addr),
            role,
            healthy,
            reported_load: load,
            reserved: 0,
            last_seen_ms: 0,
        }
    }

    fn snapshot(mut endpoints: Vec<EndpointView>) -> PoolSnapshot {
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        PoolSnapshot {
            pool: "p".to_string(),
            endpoints,
        }
    }

    fn ctx(eligible: bool) -> RequestContext {
        RequestContext {
            request_id: "r".to_string(),
            model: "m".to_string(),
            prompt_tokens: 10,
            approximate: false,
            disaggregation_eligible: eligible,
            deadline: Instant::now(),
        }
    }

    fn selected(d: RoutingDecision) -> Pick {
        match d {
            RoutingDecision::Selected(p) => p,
            other => panic!("expected a pick, got {other:?}"),
        }
    }

    #[test]
    fn test_lowest_load_wins() {
        let snap = snapshot(vec![
            ep("a:1", EndpointRole::Unified, 5, true),
            ep("b:1", EndpointRole::Unified, 2, true),
            ep("c:1", EndpointRole::Unified, 8, true),
        ]);
        let p = selected(pick(&snap, &ctx(false), &PickerConfig::default()));
        assert_eq!(p.endpoint.as_str(), "b:1");
        assert_eq!(p.load, 2);
        assert_eq!(p.rationale, Rationale::RoleMatch);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let snap = snapshot(vec![
            ep("z:1", EndpointRole::Unified, 1, true),
            ep("m:1", EndpointRole::Unified, 1, true),
            ep("x:1", EndpointRole::Unified, 4, true),
        ]);
        for _ in 0..50 {
            let p = selected(pick(&snap, &ctx(false), &PickerConfig::default()));
            assert_eq!(p.endpoint.as_str(), "m:1");
        }
    }

    #[test]
    fn test_reservations_count_toward_load() {
        let mut busy = ep("a:1", EndpointRole::Unified, 1, true);
        busy.reserved = 3;
        let snap = snapshot(vec![busy, ep("b:1", EndpointRole::Unified, 2, true)]);
        let p = selected(pick(&snap, &ctx(false), &PickerConfig::default()));
        assert_eq!(p.endpoint.as_str(), "b:1");
    }

    #[test]
    fn test_no_healthy_endpoints() {
        let snap = snapshot(vec![
            ep("a:1", EndpointRole::Unified, 0, false),
            ep("b:1", EndpointRole::Decode, 0, false),
        ]);
        assert_eq!(
            pick(&snap, &ctx(false), &PickerConfig::default()),
            RoutingDecision::NoEndpointAvailable {
                healthy: 0,
                total: 2
            }
        );
        assert_eq!(
            pick(&snapshot(vec![]), &ctx(true), &PickerConfig::default()),
            RoutingDecision::NoEndpointAvailable {
                healthy: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_eligible_request_goes_to_prefill() {
        let snap = snapshot(vec![
            ep("d:1", EndpointRole::Decode, 0, true),
            ep("p:1", EndpointRole::Prefill, 9, true),
        ]);
        let p = selected(pick(&snap, &ctx(true), &PickerConfig::default()));
        assert_eq!(p.endpoint.as_str(), "p:1");
        assert_eq!(p.role, EndpointRole::Prefill);
    }

    #[test]
    fn test_eligible_without_prefill_subpool_uses_decode() {
        let snap = snapshot(vec![
            ep("d:1", EndpointRole::Decode, 3, true),
            ep("u:1", EndpointRole::Unified, 1, true),
        ]);
        let p = selected(pick(&snap, &ctx(true), &PickerConfig::default()));
        assert_eq!(p.endpoint.as_str(), "u:1");
        assert_eq!(p.rationale, Rationale::RoleMatch);
    }

    #[test]
    fn test_eligible_falls_back_when_prefill_unhealthy() {
        let snap = snapshot(vec![
            ep("d:1", EndpointRole::Decode, 3, true),
            ep("p:1", EndpointRole::Prefill, 0, false),
        ]);
        let p = selected(pick(&snap, &ctx(true), &PickerConfig::default()));
        assert_eq!(p.endpoint.as_str(), "d:1");
        assert_eq!(p.rationale, Rationale::Fallback);
    }

    #[test]
    fn test_non_eligible_never_selects_prefill() {
        let prefill_only = snapshot(vec![
            ep("p:1", EndpointRole::Prefill, 0, true),
            ep("p:2", EndpointRole::Prefill, 0, true),
        ]);
        assert!(matches!(
            pick(&prefill_only, &ctx(false), &PickerConfig::default()),
            RoutingDecision::NoEndpointAvailable { healthy: 2, total: 2 }
        ));

        let mixed = snapshot(vec![
            ep("p:1", EndpointRole::Prefill, 0, true),
            ep("d:1", EndpointRole::Decode, 50, true),
        ]);
        for saturation_load in [None, Some(1)] {
            let config = PickerConfig {
                saturation_load,
                approximate_headroom: 0,
            };
            let p = selected(pick(&mixed, &ctx(false), &config));
            assert_ne!(p.role, EndpointRole::Prefill);
        }
    }

    #[test]
    fn test_saturation_margin_is_wider_for_approximate_requests() {
        let snap = snapshot(vec![
            ep("a:1", EndpointRole::Unified, 3, true),
            ep("b:1", EndpointRole::Unified, 6, true),
        ]);
        let config = PickerConfig {
            saturation_load: Some(8),
            approximate_headroom: 6,
        };

        let exact = selected(pick(&snap, &ctx(false), &config));
        assert_eq!(exact.endpoint.as_str(), "a:1");
        assert!(!exact.saturated);

        let mut approx = ctx(false);
        approx.approximate = true;
        let p = selected(pick(&snap, &approx, &config));
        assert_eq!(p.endpoint.as_str(), "a:1");
        assert!(p.saturated);

        let unbounded = selected(pick(&snap, &approx, &PickerConfig::default()));
        assert!(!unbounded.saturated);
    }
}
