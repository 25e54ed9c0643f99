use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    DescriptorId, DescriptorRegistry, FrameObject, FrameStoreError, KindTable, PoolConfig, Result,
    WellKnownKind,
};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub free: usize,
    /// Unique ids handed out so far.
    pub issued: u64,
}

/// Fixed set of reusable [`FrameObject`]s sharing one descriptor registry.
///
/// The pool registers the well-known kinds at construction and hands frames
/// out with fresh unique ids. A frame only comes back once no client holds it
/// and none of its items is retained.
pub struct FrameObjectPool {
    registry: Arc<DescriptorRegistry>,
    kinds: KindTable,
    frames: Vec<Arc<FrameObject>>,
    free: Mutex<VecDeque<usize>>,
    next_unique_id: AtomicU64,
}

impl FrameObjectPool {
    /// Creates a pool with its own registry.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        Self::with_registry(Arc::new(DescriptorRegistry::new()), config)
    }

    /// Creates a pool over an existing registry. Custom kinds may be
    /// registered with it before or after the well-known ones.
    pub fn with_registry(registry: Arc<DescriptorRegistry>, config: &PoolConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(FrameStoreError::bad_parameter("pool capacity must be non-zero"));
        }
        let kinds = KindTable::register_all(&registry)?;

        let mut frames = Vec::new();
        frames.try_reserve_exact(config.capacity)?;
        let mut free = VecDeque::new();
        free.try_reserve_exact(config.capacity)?;
        for index in 0..config.capacity {
            frames.push(Arc::new(FrameObject::new(registry.clone(), 0)));
            free.push_back(index);
        }

        tracing::debug!(capacity = config.capacity, "frame pool created");
        Ok(Self {
            registry,
            kinds,
            frames,
            free: Mutex::new(free),
            next_unique_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    /// Shorthand for the id bound to a well-known kind.
    pub fn kind_id(&self, kind: WellKnownKind) -> DescriptorId {
        self.kinds.id(kind)
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Hands out a free frame. Fails with `InvalidState` when every frame is
    /// in use.
    pub fn acquire(&self) -> Result<Arc<FrameObject>> {
        self.acquire_inner(false)
    }

    /// Hands out a frame flagged as a dummy.
    pub fn acquire_dummy(&self) -> Result<Arc<FrameObject>> {
        self.acquire_inner(true)
    }

    fn acquire_inner(&self, is_dummy: bool) -> Result<Arc<FrameObject>> {
        let index = self
            .lock_free()?
            .pop_front()
            .ok_or_else(|| FrameStoreError::invalid_state("frame pool exhausted"))?;
        let frame = &self.frames[index];
        let unique_id = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = frame.activate(unique_id, is_dummy) {
            self.lock_free()?.push_back(index);
            return Err(err);
        }
        tracing::trace!(frame = unique_id, is_dummy, "frame acquired");
        Ok(frame.clone())
    }

    /// Returns `frame` to the pool if it is reclaimable. Returns `false`, and
    /// leaves the frame untouched, while a client or an item retain still
    /// holds it.
    pub fn try_reclaim(&self, frame: &Arc<FrameObject>) -> Result<bool> {
        let index = self
            .frames
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, frame))
            .ok_or_else(|| FrameStoreError::bad_value("frame does not belong to this pool"))?;
        let unique_id = frame.unique_id();
        if !frame.try_deactivate()? {
            return Ok(false);
        }
        self.lock_free()?.push_back(index);
        tracing::trace!(frame = unique_id, "frame reclaimed");
        Ok(true)
    }

    /// Reclaims every in-use frame that has become reclaimable. Returns how
    /// many frames went back to the pool. A frame that fails to reclaim is
    /// logged and skipped.
    pub fn reclaim_ready(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for frame in self.frames.iter().filter(|frame| frame.in_use()) {
            match self.try_reclaim(frame) {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(frame = frame.unique_id(), error = %err, "failed to reclaim frame")
                }
            }
        }
        Ok(reclaimed)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let free = self.lock_free()?.len();
        Ok(PoolStats {
            capacity: self.frames.len(),
            in_use: self.frames.len() - free,
            free,
            issued: self.next_unique_id.load(Ordering::Relaxed) - 1,
        })
    }

    fn lock_free(&self) -> Result<MutexGuard<'_, VecDeque<usize>>> {
        self.free
            .lock()
            .map_err(|_| FrameStoreError::poisoned("frame pool"))
    }
}

impl fmt::Debug for FrameObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameObjectPool")
            .field("capacity", &self.frames.len())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{ClientMask, ErrorKind, ExposureInfo, Lifecycle};

    fn pool(capacity: usize) -> FrameObjectPool {
        FrameObjectPool::new(&PoolConfig { capacity }).unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = FrameObjectPool::new(&PoolConfig { capacity: 0 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[test]
    fn exhausts_and_recovers() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err().kind(), ErrorKind::InvalidState);

        assert!(pool.try_reclaim(&a).unwrap());
        assert!(!a.in_use());
        let c = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn unique_ids_are_never_repeated() {
        let pool = pool(1);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let frame = pool.acquire().unwrap();
            assert!(seen.insert(frame.unique_id()));
            assert!(pool.try_reclaim(&frame).unwrap());
        }
        assert_eq!(pool.stats().unwrap().issued, 5);
    }

    #[test]
    fn held_frames_are_not_reclaimed() {
        let pool = pool(1);
        let exposure = pool.kind_id(WellKnownKind::Exposure);
        let frame = pool.acquire().unwrap();
        frame
            .insert(
                exposure,
                ExposureInfo {
                    exposure_time_us: 10_000,
                    analog_gain: 2.0,
                    digital_gain: 1.0,
                },
            )
            .unwrap();
        frame.set_client_mask(ClientMask::CAPTURE).unwrap();
        frame.retain(exposure).unwrap();

        assert!(!pool.try_reclaim(&frame).unwrap());
        frame.clear_client_mask(ClientMask::CAPTURE).unwrap();
        assert!(!pool.try_reclaim(&frame).unwrap());
        frame.is_valid(exposure).unwrap();

        frame.release(exposure).unwrap();
        assert_eq!(pool.reclaim_ready().unwrap(), 1);
        assert!(frame.is_valid(exposure).is_err());
        assert_eq!(pool.stats().unwrap().free, 1);
    }

    #[test]
    fn destroyed_frames_do_not_stall_reclaim() {
        let pool = pool(2);
        let exposure = pool.kind_id(WellKnownKind::Exposure);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.destroy().unwrap(), Lifecycle::Destroyed);

        assert_eq!(pool.reclaim_ready().unwrap(), 2);
        assert!(!b.in_use());
        assert_eq!(pool.stats().unwrap().free, 2);

        // The destroyed frame comes back with a usable item table.
        let first = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert_eq!(first.lifecycle(), Lifecycle::Active);
        first
            .insert(
                exposure,
                ExposureInfo {
                    exposure_time_us: 5_000,
                    analog_gain: 1.0,
                    digital_gain: 1.0,
                },
            )
            .unwrap();
        first.is_valid(exposure).unwrap();
    }

    #[test]
    fn pending_destroy_keeps_frame_out_of_the_pool() {
        let pool = pool(1);
        let exposure = pool.kind_id(WellKnownKind::Exposure);
        let frame = pool.acquire().unwrap();
        frame
            .insert(
                exposure,
                ExposureInfo {
                    exposure_time_us: 5_000,
                    analog_gain: 1.0,
                    digital_gain: 1.0,
                },
            )
            .unwrap();
        frame.retain(exposure).unwrap();
        assert_eq!(frame.destroy().unwrap(), Lifecycle::DestroyPending);

        assert_eq!(pool.reclaim_ready().unwrap(), 0);
        frame.release(exposure).unwrap();
        assert_eq!(pool.reclaim_ready().unwrap(), 1);
        assert_eq!(pool.acquire().unwrap().lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn dummy_frames_are_flagged_and_cleared_on_reuse() {
        let pool = pool(1);
        let dummy = pool.acquire_dummy().unwrap();
        assert!(dummy.is_dummy());
        pool.try_reclaim(&dummy).unwrap();
        assert!(!pool.acquire().unwrap().is_dummy());
    }

    #[test]
    fn foreign_frames_are_rejected() {
        let pool = pool(1);
        let stranger = Arc::new(FrameObject::new(pool.registry().clone(), 0));
        assert_eq!(
            pool.try_reclaim(&stranger).unwrap_err().kind(),
            ErrorKind::BadValue
        );
    }
}
