//! Resource pool: fixed registries of compute backends and model instances.
//!
//! Allocation policy:
//! - A requester first asks for a completely free slot of the right class
//!   (and, for model instances, an accepted size class).
//! - Model-instance requests may fall back to the least-loaded compatible
//!   slot instead of waiting. Compute backends never double-book.

mod slot;

pub use slot::{ResourceClass, ResourceId, ResourceSlot, SizeClass};

use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Allocation contract the scheduler depends on.
///
/// `ResourcePool` is the production implementation; tests can substitute
/// their own.
pub trait ResourceAllocator: Send {
    /// Claim a completely free, compatible slot. `preferred` is tried first.
    fn try_acquire_free(
        &mut self,
        class: ResourceClass,
        size: Option<SizeClass>,
        preferred: Option<ResourceId>,
    ) -> Option<ResourceId>;

    /// Claim the least-loaded compatible slot even if it is busy.
    /// Only model instances may be shared this way.
    fn acquire_least_busy(
        &mut self,
        class: ResourceClass,
        size: Option<SizeClass>,
    ) -> Option<ResourceId>;

    /// Claim a specific slot.
    fn acquire(&mut self, id: ResourceId) -> Result<(), PoolError>;

    /// Give one claim on a slot back.
    fn release(&mut self, id: ResourceId) -> Result<(), PoolError>;

    /// Whether the slot currently carries any in-flight dispatch.
    fn is_busy(&self, id: ResourceId) -> bool;
}

/// The production resource pool.
#[derive(Debug, Default)]
pub struct ResourcePool {
    slots: Vec<ResourceSlot>,
}

impl ResourcePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from a configured layout.
    pub fn from_config(config: &PoolConfig) -> Self {
        let mut pool = Self::new();
        for backend in &config.compute_backends {
            pool.add_compute_backend(&backend.name);
        }
        for instance in &config.model_instances {
            pool.add_model_instance(&instance.name, &instance.accepts);
        }
        pool
    }

    /// Register a compute-backend slot.
    pub fn add_compute_backend(&mut self, name: impl Into<String>) -> ResourceId {
        let id = ResourceId(self.slots.len());
        self.slots
            .push(ResourceSlot::new(id, name, ResourceClass::ComputeBackend, Vec::new()));
        id
    }

    /// Register a model-instance slot accepting the given size classes.
    pub fn add_model_instance(
        &mut self,
        name: impl Into<String>,
        accepts: &[SizeClass],
    ) -> ResourceId {
        let id = ResourceId(self.slots.len());
        self.slots.push(ResourceSlot::new(
            id,
            name,
            ResourceClass::ModelInstance,
            accepts.to_vec(),
        ));
        id
    }

    /// Take a slot out of service. Its id stays reserved and any further
    /// acquisition on it is an integrity error.
    pub fn remove(&mut self, id: ResourceId) -> Result<ResourceSlot, PoolError> {
        let slot = self.live_slot_mut(id)?;
        slot.removed = true;
        Ok(slot.clone())
    }

    /// Look up a slot.
    pub fn slot(&self, id: ResourceId) -> Option<&ResourceSlot> {
        self.slots.get(id.0).filter(|s| !s.removed)
    }

    /// All live slots.
    pub fn slots(&self) -> impl Iterator<Item = &ResourceSlot> {
        self.slots.iter().filter(|s| !s.removed)
    }

    /// Number of free slots of a class.
    pub fn free_count(&self, class: ResourceClass) -> usize {
        self.slots()
            .filter(|s| s.class == class && !s.is_busy())
            .count()
    }

    fn live_slot_mut(&mut self, id: ResourceId) -> Result<&mut ResourceSlot, PoolError> {
        self.slots
            .get_mut(id.0)
            .filter(|s| !s.removed)
            .ok_or(PoolError::InvalidSlot(id))
    }

    fn compatible(
        &self,
        class: ResourceClass,
        size: Option<SizeClass>,
    ) -> impl Iterator<Item = &ResourceSlot> {
        self.slots()
            .filter(move |s| s.class == class && s.accepts_size(size))
    }
}

impl ResourceAllocator for ResourcePool {
    fn try_acquire_free(
        &mut self,
        class: ResourceClass,
        size: Option<SizeClass>,
        preferred: Option<ResourceId>,
    ) -> Option<ResourceId> {
        let preferred = preferred.filter(|id| {
            self.slot(*id)
                .is_some_and(|s| s.class == class && s.accepts_size(size) && !s.is_busy())
        });

        let id = preferred.or_else(|| {
            self.compatible(class, size)
                .find(|s| !s.is_busy())
                .map(|s| s.id)
        })?;

        self.slots[id.0].load += 1;
        debug!(slot = %id, ?class, ?size, "Acquired free slot");
        Some(id)
    }

    fn acquire_least_busy(
        &mut self,
        class: ResourceClass,
        size: Option<SizeClass>,
    ) -> Option<ResourceId> {
        if class != ResourceClass::ModelInstance {
            return None;
        }

        let id = self
            .compatible(class, size)
            .min_by_key(|s| s.load)
            .map(|s| s.id)?;

        let slot = &mut self.slots[id.0];
        slot.load += 1;
        debug!(slot = %id, load = slot.load, ?size, "Shared least-busy model instance");
        Some(id)
    }

    fn acquire(&mut self, id: ResourceId) -> Result<(), PoolError> {
        let slot = match self.live_slot_mut(id) {
            Ok(slot) => slot,
            Err(e) => {
                error!(slot = %id, "Integrity violation: acquire on invalid slot");
                return Err(e);
            }
        };
        if slot.class == ResourceClass::ComputeBackend && slot.is_busy() {
            return Err(PoolError::AlreadyBusy(id));
        }
        slot.load += 1;
        Ok(())
    }

    fn release(&mut self, id: ResourceId) -> Result<(), PoolError> {
        let slot = match self.live_slot_mut(id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(slot = %id, "Integrity violation: release on invalid slot");
                return Err(e);
            }
        };
        if slot.load == 0 {
            error!(slot = %id, name = %slot.name, "Integrity violation: releasing a slot that is not busy");
            return Err(PoolError::NotBusy(id));
        }
        slot.load -= 1;
        debug!(slot = %id, load = slot.load, "Released slot");
        Ok(())
    }

    fn is_busy(&self, id: ResourceId) -> bool {
        self.slot(id).is_some_and(|s| s.is_busy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (ResourcePool, ResourceId, ResourceId, ResourceId) {
        let mut pool = ResourcePool::new();
        let gpu = pool.add_compute_backend("gpu0");
        let small = pool.add_model_instance("llm-small", &[SizeClass::Small]);
        let large = pool.add_model_instance("llm-large", &[SizeClass::Large]);
        (pool, gpu, small, large)
    }

    #[test]
    fn free_slot_is_claimed_once() {
        let (mut pool, gpu, _, _) = pool();
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ComputeBackend, None, None),
            Some(gpu)
        );
        assert!(pool.is_busy(gpu));
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ComputeBackend, None, None),
            None
        );
    }

    #[test]
    fn compute_backends_never_fall_back() {
        let (mut pool, _, _, _) = pool();
        pool.try_acquire_free(ResourceClass::ComputeBackend, None, None)
            .unwrap();
        assert_eq!(
            pool.acquire_least_busy(ResourceClass::ComputeBackend, None),
            None
        );
    }

    #[test]
    fn size_class_acceptance_is_respected() {
        let (mut pool, _, small, large) = pool();
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ModelInstance, Some(SizeClass::Large), None),
            Some(large)
        );
        // The only other instance is small-only and must reject a large job.
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ModelInstance, Some(SizeClass::Large), None),
            None
        );
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ModelInstance, Some(SizeClass::Small), None),
            Some(small)
        );
    }

    #[test]
    fn least_busy_shares_model_instances() {
        let mut pool = ResourcePool::new();
        let a = pool.add_model_instance("a", &[SizeClass::Small, SizeClass::Large]);
        let b = pool.add_model_instance("b", &[SizeClass::Small, SizeClass::Large]);

        let size = Some(SizeClass::Small);
        assert_eq!(pool.try_acquire_free(ResourceClass::ModelInstance, size, None), Some(a));
        assert_eq!(pool.try_acquire_free(ResourceClass::ModelInstance, size, None), Some(b));
        assert_eq!(pool.try_acquire_free(ResourceClass::ModelInstance, size, None), None);

        assert_eq!(pool.acquire_least_busy(ResourceClass::ModelInstance, size), Some(a));
        // a now has load 2, so b is least busy.
        assert_eq!(pool.acquire_least_busy(ResourceClass::ModelInstance, size), Some(b));

        pool.release(a).unwrap();
        assert!(pool.is_busy(a));
        pool.release(a).unwrap();
        assert!(!pool.is_busy(a));
    }

    #[test]
    fn preferred_slot_wins_when_free() {
        let mut pool = ResourcePool::new();
        let _a = pool.add_compute_backend("a");
        let b = pool.add_compute_backend("b");
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ComputeBackend, None, Some(b)),
            Some(b)
        );
    }

    #[test]
    fn releasing_free_slot_is_reported() {
        let (mut pool, gpu, _, _) = pool();
        assert!(matches!(pool.release(gpu), Err(PoolError::NotBusy(id)) if id == gpu));
        // Pool stays usable.
        assert!(pool.try_acquire_free(ResourceClass::ComputeBackend, None, None).is_some());
    }

    #[test]
    fn acquire_on_removed_slot_fails() {
        let (mut pool, gpu, _, _) = pool();
        pool.remove(gpu).unwrap();
        assert!(matches!(pool.acquire(gpu), Err(PoolError::InvalidSlot(_))));
        assert!(matches!(
            pool.acquire(ResourceId(99)),
            Err(PoolError::InvalidSlot(_))
        ));
        assert_eq!(pool.free_count(ResourceClass::ComputeBackend), 0);
    }

    #[test]
    fn acquire_specific_compute_slot_twice_fails() {
        let (mut pool, gpu, _, _) = pool();
        pool.acquire(gpu).unwrap();
        assert!(matches!(pool.acquire(gpu), Err(PoolError::AlreadyBusy(_))));
    }

    #[test]
    fn from_config_registers_all_slots() {
        let pool = ResourcePool::from_config(&PoolConfig::local());
        assert_eq!(pool.slots().count(), 2);
        assert_eq!(pool.free_count(ResourceClass::ComputeBackend), 1);
        assert_eq!(pool.free_count(ResourceClass::ModelInstance), 1);
    }
}
