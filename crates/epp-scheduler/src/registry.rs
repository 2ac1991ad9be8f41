//! Pool registry: the only shared mutable state in the picker.
//!
//! Reads go through `arc-swap` snapshots and never block. Membership changes
//! (register/remove/expire) are copy-on-update under a writer mutex. Load and
//! health updates swap a single endpoint's state record with compare-and-swap,
//! so writers of different endpoints never contend.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use epp_common::{now_ms, EndpointId, EndpointRole};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("pool '{0}' not found")]
    PoolNotFound(String),
    #[error("endpoint '{0}' not registered")]
    EndpointNotFound(EndpointId),
    #[error("endpoint '{endpoint}' already belongs to pool '{existing}', cannot join '{requested}'")]
    PoolConflict {
        endpoint: EndpointId,
        existing: String,
        requested: String,
    },
}

/// A single change reported by a load/health collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointUpdate {
    /// Absolute load as observed on the backend. Clears speculative reservations.
    Load(u64),
    /// Relative change to the reported load, saturating at zero. Like `Load`
    /// it is a real observation, so it also clears speculative reservations.
    LoadDelta(i64),
    Health(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EndpointState {
    reported_load: u64,
    reserved: u64,
    healthy: bool,
    last_seen_ms: u64,
    /// Bumped by every absolute load report; reservations taken under an older
    /// generation were already absorbed by that report.
    generation: u64,
}

#[derive(Debug)]
struct EndpointSlot {
    id: EndpointId,
    pool: String,
    role: EndpointRole,
    state: ArcSwap<EndpointState>,
}

impl EndpointSlot {
    fn view(&self) -> EndpointView {
        let st = self.state.load();
        EndpointView {
            id: self.id.clone(),
            role: self.role,
            healthy: st.healthy,
            reported_load: st.reported_load,
            reserved: st.reserved,
            last_seen_ms: st.last_seen_ms,
        }
    }
}

#[derive(Debug)]
struct Pool {
    /// Sorted by endpoint id.
    members: ArcSwap<Vec<Arc<EndpointSlot>>>,
}

impl Pool {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            members: ArcSwap::from_pointee(Vec::new()),
        })
    }
}

/// Point-in-time copy of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointView {
    pub id: EndpointId,
    pub role: EndpointRole,
    pub healthy: bool,
    pub reported_load: u64,
    pub reserved: u64,
    pub last_seen_ms: u64,
}

impl EndpointView {
    /// Load signal used for scheduling: reported plus speculative reservations.
    pub fn load(&self) -> u64 {
        self.reported_load.saturating_add(self.reserved)
    }
}

/// Consistent read of a pool, ordered by endpoint id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub pool: String,
    pub endpoints: Vec<EndpointView>,
}

impl PoolSnapshot {
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.healthy).count()
    }
}

#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: ArcSwap<HashMap<String, Arc<Pool>>>,
    index: ArcSwap<HashMap<EndpointId, Arc<EndpointSlot>>>,
    membership: Mutex<()>,
}

impl PoolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a pool known even while it has no members.
    pub fn declare_pool(&self, pool: &str) {
        let _guard = self.membership.lock();
        self.ensure_pool(pool);
    }

    fn ensure_pool(&self, pool: &str) -> Arc<Pool> {
        if let Some(p) = self.pools.load().get(pool) {
            return p.clone();
        }
        let created = Pool::empty();
        let mut next = HashMap::clone(&self.pools.load());
        next.insert(pool.to_string(), created.clone());
        self.pools.store(Arc::new(next));
        tracing::info!(pool, "pool declared");
        created
    }

    pub fn exists(&self, pool: &str) -> bool {
        self.pools.load().contains_key(pool)
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.index.load().contains_key(id)
    }

    pub fn snapshot(&self, pool: &str) -> Result<PoolSnapshot, RegistryError> {
        let pools = self.pools.load();
        let p = pools
            .get(pool)
            .ok_or_else(|| RegistryError::PoolNotFound(pool.to_string()))?;
        let members = p.members.load();
        Ok(PoolSnapshot {
            pool: pool.to_string(),
            endpoints: members.iter().map(|slot| slot.view()).collect(),
        })
    }

    /// Fresh registration. Returns `false` when the endpoint is already a member
    /// of `pool`, leaving its state untouched.
    pub fn register(
        &self,
        pool: &str,
        id: EndpointId,
        role: EndpointRole,
    ) -> Result<bool, RegistryError> {
        self.register_at(pool, id, role, now_ms())
    }

    pub fn register_at(
        &self,
        pool: &str,
        id: EndpointId,
        role: EndpointRole,
        now_ms: u64,
    ) -> Result<bool, RegistryError> {
        let _guard = self.membership.lock();

        if let Some(existing) = self.index.load().get(&id) {
            if existing.pool == pool {
                return Ok(false);
            }
            return Err(RegistryError::PoolConflict {
                endpoint: id,
                existing: existing.pool.clone(),
                requested: pool.to_string(),
            });
        }

        let slot = Arc::new(EndpointSlot {
            id: id.clone(),
            pool: pool.to_string(),
            role,
            state: ArcSwap::from_pointee(EndpointState {
                reported_load: 0,
                reserved: 0,
                healthy: true,
                last_seen_ms: now_ms,
                generation: 0,
            }),
        });

        let p = self.ensure_pool(pool);
        let mut members = Vec::clone(&p.members.load());
        members.push(slot.clone());
        members.sort_by(|a, b| a.id.cmp(&b.id));
        p.members.store(Arc::new(members));

        let mut index = HashMap::clone(&self.index.load());
        index.insert(id.clone(), slot);
        self.index.store(Arc::new(index));

        tracing::info!(pool, endpoint = %id, role = %role, "endpoint registered");
        Ok(true)
    }

    pub fn update(&self, id: &EndpointId, update: EndpointUpdate) -> Result<(), RegistryError> {
        self.update_at(id, update, now_ms())
    }

    /// Apply one update atomically. Positive evidence (a load report or
    /// `Health(true)`) refreshes last-seen; `Health(false)` does not, so a
    /// failing endpoint still ages out.
    pub fn update_at(
        &self,
        id: &EndpointId,
        update: EndpointUpdate,
        now_ms: u64,
    ) -> Result<(), RegistryError> {
        let slot = self
            .index
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::EndpointNotFound(id.clone()))?;

        slot.state.rcu(|cur| {
            let mut next = EndpointState::clone(cur);
            match update {
                EndpointUpdate::Load(load) => {
                    next.reported_load = load;
                    next.reserved = 0;
                    next.generation = next.generation.wrapping_add(1);
                    next.last_seen_ms = now_ms;
                }
                EndpointUpdate::LoadDelta(delta) => {
                    next.reported_load = if delta >= 0 {
                        next.reported_load.saturating_add(delta as u64)
                    } else {
                        next.reported_load.saturating_sub(delta.unsigned_abs())
                    };
                    next.reserved = 0;
                    next.generation = next.generation.wrapping_add(1);
                    next.last_seen_ms = now_ms;
                }
                EndpointUpdate::Health(healthy) => {
                    next.healthy = healthy;
                    if healthy {
                        next.last_seen_ms = now_ms;
                    }
                }
            }
            next
        });
        Ok(())
    }

    pub fn remove(&self, id: &EndpointId) -> bool {
        let _guard = self.membership.lock();
        self.remove_locked(id)
    }

    fn remove_locked(&self, id: &EndpointId) -> bool {
        let Some(slot) = self.index.load().get(id).cloned() else {
            return false;
        };

        let mut index = HashMap::clone(&self.index.load());
        index.remove(id);
        self.index.store(Arc::new(index));

        if let Some(p) = self.pools.load().get(&slot.pool) {
            let members: Vec<Arc<EndpointSlot>> = p
                .members
                .load()
                .iter()
                .filter(|m| &m.id != id)
                .cloned()
                .collect();
            p.members.store(Arc::new(members));
        }

        tracing::info!(pool = %slot.pool, endpoint = %id, "endpoint removed");
        true
    }

    /// Remove every endpoint not seen for longer than `ttl_ms`.
    pub fn expire_stale(&self, now_ms: u64, ttl_ms: u64) -> Vec<EndpointId> {
        let _guard = self.membership.lock();
        let stale: Vec<EndpointId> = self
            .index
            .load()
            .values()
            .filter(|slot| now_ms.saturating_sub(slot.state.load().last_seen_ms) > ttl_ms)
            .map(|slot| slot.id.clone())
            .collect();

        for id in &stale {
            self.remove_locked(id);
        }
        stale
    }

    /// Speculatively add one unit of load to `id`. The reservation is undone
    /// when the returned guard is dropped without [`Reservation::commit`].
    pub fn reserve(&self, id: &EndpointId) -> Option<Reservation> {
        let slot = self.index.load().get(id).cloned()?;
        let prev = slot.state.rcu(|cur| {
            let mut next = EndpointState::clone(cur);
            next.reserved = next.reserved.saturating_add(1);
            next
        });
        Some(Reservation {
            slot,
            generation: prev.generation,
            armed: true,
        })
    }
}

/// Speculative load increment held by a session until its decision reaches
/// the proxy. Dropping an armed reservation releases it.
#[derive(Debug)]
pub struct Reservation {
    slot: Arc<EndpointSlot>,
    generation: u64,
    armed: bool,
}

impl Reservation {
    /// Keep the increment; the next load report replaces it.
    pub fn commit(mut self) {
        self.armed = false;
    }

    fn release(&self) {
        let generation = self.generation;
        self.slot.state.rcu(|cur| {
            let mut next = EndpointState::clone(cur);
            if next.generation == generation && next.reserved > 0 {
                next.reserved -= 1;
            }
            next
        });
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.release();
            tracing::debug!(endpoint = %self.slot.id, "speculative reservation released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EndpointId {
        EndpointId::from(s)
    }

    fn registry_with(pool: &str, eps: &[(&str, EndpointRole)]) -> Arc<PoolRegistry> {
        let reg = PoolRegistry::new();
        for (addr, role) in eps {
            reg.register_at(pool, id(addr), *role, 1_000).unwrap();
        }
        reg
    }

    #[test]
    fn test_snapshot_unknown_pool() {
        let reg = PoolRegistry::new();
        assert_eq!(
            reg.snapshot("missing"),
            Err(RegistryError::PoolNotFound("missing".to_string()))
        );
        assert!(!reg.exists("missing"));
    }

    #[test]
    fn test_declared_pool_is_empty_not_missing() {
        let reg = PoolRegistry::new();
        reg.declare_pool("p");
        let snap = reg.snapshot("p").unwrap();
        assert!(snap.endpoints.is_empty());
        assert!(reg.exists("p"));
    }

    #[test]
    fn test_snapshot_is_ordered_by_identity() {
        let reg = registry_with(
            "p",
            &[
                ("10.0.0.3:8000", EndpointRole::Unified),
                ("10.0.0.1:8000", EndpointRole::Unified),
                ("10.0.0.2:8000", EndpointRole::Decode),
            ],
        );
        let ids: Vec<String> = reg
            .snapshot("p")
            .unwrap()
            .endpoints
            .iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["10.0.0.1:8000", "10.0.0.2:8000", "10.0.0.3:8000"]);
    }

    #[test]
    fn test_endpoint_belongs_to_one_pool() {
        let reg = registry_with("a", &[("h:1", EndpointRole::Unified)]);
        assert_eq!(reg.register("a", id("h:1"), EndpointRole::Unified), Ok(false));
        assert!(matches!(
            reg.register("b", id("h:1"), EndpointRole::Unified),
            Err(RegistryError::PoolConflict { .. })
        ));
    }

    #[test]
    fn test_updates_apply_in_order() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        reg.update_at(&id("h:1"), EndpointUpdate::Load(4), 2_000).unwrap();
        reg.update_at(&id("h:1"), EndpointUpdate::LoadDelta(3), 2_001).unwrap();
        reg.update_at(&id("h:1"), EndpointUpdate::LoadDelta(-10), 2_002).unwrap();
        reg.update_at(&id("h:1"), EndpointUpdate::Health(false), 2_003).unwrap();

        let ep = &reg.snapshot("p").unwrap().endpoints[0];
        assert_eq!(ep.reported_load, 0);
        assert!(!ep.healthy);
        assert_eq!(ep.last_seen_ms, 2_002);
    }

    #[test]
    fn test_update_unknown_endpoint() {
        let reg = PoolRegistry::new();
        assert_eq!(
            reg.update(&id("h:1"), EndpointUpdate::Load(1)),
            Err(RegistryError::EndpointNotFound(id("h:1")))
        );
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        reg.update(&id("h:1"), EndpointUpdate::Load(2)).unwrap();

        let r = reg.reserve(&id("h:1")).unwrap();
        assert_eq!(reg.snapshot("p").unwrap().endpoints[0].load(), 3);
        drop(r);
        assert_eq!(reg.snapshot("p").unwrap().endpoints[0].load(), 2);
    }

    #[test]
    fn test_committed_reservation_cleared_by_load_report() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        reg.reserve(&id("h:1")).unwrap().commit();
        reg.reserve(&id("h:1")).unwrap().commit();
        assert_eq!(reg.snapshot("p").unwrap().endpoints[0].reserved, 2);

        reg.update(&id("h:1"), EndpointUpdate::Load(7)).unwrap();
        let ep = &reg.snapshot("p").unwrap().endpoints[0];
        assert_eq!(ep.reserved, 0);
        assert_eq!(ep.load(), 7);
    }

    #[test]
    fn test_load_delta_absorbs_committed_reservation() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        reg.reserve(&id("h:1")).unwrap().commit();
        let stale = reg.reserve(&id("h:1")).unwrap();

        reg.update(&id("h:1"), EndpointUpdate::LoadDelta(1)).unwrap();
        drop(stale);
        let ep = &reg.snapshot("p").unwrap().endpoints[0];
        assert_eq!(ep.reported_load, 1);
        assert_eq!(ep.reserved, 0);
        assert_eq!(ep.load(), 1);
    }

    #[test]
    fn test_release_after_load_report_does_not_undercount() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        let stale = reg.reserve(&id("h:1")).unwrap();
        reg.update(&id("h:1"), EndpointUpdate::Load(5)).unwrap();
        reg.reserve(&id("h:1")).unwrap().commit();

        drop(stale);
        let ep = &reg.snapshot("p").unwrap().endpoints[0];
        assert_eq!(ep.reserved, 1);
        assert_eq!(ep.load(), 6);
    }

    #[test]
    fn test_expired_endpoint_needs_fresh_registration() {
        let reg = registry_with(
            "p",
            &[("h:1", EndpointRole::Unified), ("h:2", EndpointRole::Unified)],
        );
        reg.update_at(&id("h:2"), EndpointUpdate::Load(1), 9_000).unwrap();

        let expired = reg.expire_stale(10_000, 5_000);
        assert_eq!(expired, vec![id("h:1")]);
        assert!(!reg.contains(&id("h:1")));
        assert!(reg.update(&id("h:1"), EndpointUpdate::Health(true)).is_err());
        assert!(reg.reserve(&id("h:1")).is_none());

        assert_eq!(reg.register("p", id("h:1"), EndpointRole::Unified), Ok(true));
        assert_eq!(reg.snapshot("p").unwrap().endpoints.len(), 2);
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let reg = registry_with("p", &[("h:1", EndpointRole::Unified)]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        reg.update(&id("h:1"), EndpointUpdate::LoadDelta(1)).unwrap();
                        let _ = reg.snapshot("p").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.snapshot("p").unwrap().endpoints[0].reported_load, 8_000);
    }
}
