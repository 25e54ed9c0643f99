use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    container::{Disposal, ItemTable, Lifecycle},
    DescriptorId, DescriptorRegistry, FrameStoreError, ItemValue, Result,
};

/// Pipeline stage that may hold a reference to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    /// Sensor capture and frame delivery.
    Capture,
    /// 3A and other per-frame control algorithms.
    AutoAlg,
    /// Denoise, scaling and other post-capture processing.
    PostProcess,
    /// Still or video encoder.
    Encoder,
    /// Preview and display output.
    Display,
    /// The application consuming results.
    Application,
}

bitflags::bitflags! {
    /// Set of clients currently holding a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClientMask: u32 {
        const CAPTURE = 1 << 0;
        const AUTO_ALG = 1 << 1;
        const POST_PROCESS = 1 << 2;
        const ENCODER = 1 << 3;
        const DISPLAY = 1 << 4;
        const APPLICATION = 1 << 5;
    }
}

impl ClientRole {
    pub const ALL: [ClientRole; 6] = [
        Self::Capture,
        Self::AutoAlg,
        Self::PostProcess,
        Self::Encoder,
        Self::Display,
        Self::Application,
    ];

    /// Returns the bitflag for this role.
    pub const fn as_mask(self) -> ClientMask {
        match self {
            Self::Capture => ClientMask::CAPTURE,
            Self::AutoAlg => ClientMask::AUTO_ALG,
            Self::PostProcess => ClientMask::POST_PROCESS,
            Self::Encoder => ClientMask::ENCODER,
            Self::Display => ClientMask::DISPLAY,
            Self::Application => ClientMask::APPLICATION,
        }
    }
}

impl From<ClientRole> for ClientMask {
    fn from(role: ClientRole) -> Self {
        role.as_mask()
    }
}

impl FromIterator<ClientRole> for ClientMask {
    fn from_iter<I: IntoIterator<Item = ClientRole>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ClientMask::empty(), |mask, role| mask | role.as_mask())
    }
}

struct FrameState {
    items: ItemTable,
    client_mask: ClientMask,
    unique_id: u64,
    reprocess_id: Option<u64>,
    time_created_ms: u64,
    in_use: bool,
    is_dummy: bool,
}

/// One pipeline work unit: an item table plus frame-level bookkeeping.
///
/// Item retain counts and the client mask live under the same lock, so a
/// release on one thread can never race a mask update on another. A frame is
/// reclaimable once both are drained.
pub struct FrameObject {
    registry: Arc<DescriptorRegistry>,
    state: Mutex<FrameState>,
}

impl FrameObject {
    pub fn new(registry: Arc<DescriptorRegistry>, unique_id: u64) -> Self {
        Self::with_items(registry, ItemTable::new(), unique_id)
    }

    fn with_items(registry: Arc<DescriptorRegistry>, items: ItemTable, unique_id: u64) -> Self {
        Self {
            registry,
            state: Mutex::new(FrameState {
                items,
                client_mask: ClientMask::empty(),
                unique_id,
                reprocess_id: None,
                time_created_ms: now_ms(),
                in_use: false,
                is_dummy: false,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    /// Adds `clients` to the set of holders. Returns the resulting mask.
    pub fn set_client_mask(&self, clients: impl Into<ClientMask>) -> Result<ClientMask> {
        let mut state = self.lock()?;
        state.client_mask |= clients.into();
        tracing::trace!(frame = state.unique_id, mask = ?state.client_mask, "client mask set");
        Ok(state.client_mask)
    }

    /// Removes `clients` from the set of holders. Returns the resulting mask.
    pub fn clear_client_mask(&self, clients: impl Into<ClientMask>) -> Result<ClientMask> {
        let mut state = self.lock()?;
        state.client_mask.remove(clients.into());
        tracing::trace!(frame = state.unique_id, mask = ?state.client_mask, "client mask cleared");
        Ok(state.client_mask)
    }

    pub fn client_mask(&self) -> ClientMask {
        self.state_lossy().client_mask
    }

    /// True when no client holds the frame and no item is retained.
    pub fn is_reclaimable(&self) -> bool {
        let state = self.state_lossy();
        state.client_mask.is_empty() && state.items.outstanding_retains() == 0
    }

    pub fn unique_id(&self) -> u64 {
        self.state_lossy().unique_id
    }

    pub fn set_reprocess_id(&self, reprocess_id: Option<u64>) -> Result<()> {
        self.lock()?.reprocess_id = reprocess_id;
        Ok(())
    }

    pub fn reprocess_id(&self) -> Option<u64> {
        self.state_lossy().reprocess_id
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn time_created_ms(&self) -> u64 {
        self.state_lossy().time_created_ms
    }

    /// Marks the frame as a synthetic placeholder that flows through the
    /// pipeline without a real payload.
    pub fn set_dummy(&self, is_dummy: bool) -> Result<()> {
        self.lock()?.is_dummy = is_dummy;
        Ok(())
    }

    pub fn is_dummy(&self) -> bool {
        self.state_lossy().is_dummy
    }

    /// Whether the owning pool currently has this frame handed out.
    pub fn in_use(&self) -> bool {
        self.state_lossy().in_use
    }

    pub fn insert<T>(&self, id: DescriptorId, value: T) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        self.insert_value(id, Arc::new(value))
    }

    pub fn insert_value(&self, id: DescriptorId, value: ItemValue) -> Result<()> {
        self.lock()?.items.insert(&self.registry, id, value)
    }

    /// Returns the item under `id` and retains it; pair with
    /// [`FrameObject::release`].
    pub fn get(&self, id: DescriptorId) -> Result<ItemValue> {
        self.lock()?.items.get(id)
    }

    pub fn get_as<T>(&self, id: DescriptorId) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.lock()?.items.get_as(id)
    }

    pub fn retain(&self, id: DescriptorId) -> Result<u32> {
        self.lock()?.items.retain(id)
    }

    pub fn release(&self, id: DescriptorId) -> Result<()> {
        let disposal = self.lock()?.items.release(id)?;
        disposal.run();
        Ok(())
    }

    pub fn is_valid(&self, id: DescriptorId) -> Result<()> {
        self.lock()?.items.is_valid(id)
    }

    pub fn retain_count(&self, id: DescriptorId) -> Result<u32> {
        self.lock()?.items.retain_count(id)
    }

    pub fn item_ids(&self) -> Result<Vec<DescriptorId>> {
        Ok(self.lock()?.items.item_ids())
    }

    /// Clears every item, see [`ItemContainer::reset`](crate::ItemContainer::reset).
    pub fn reset(&self) -> Result<()> {
        let disposal = self.lock()?.items.reset()?;
        disposal.run();
        Ok(())
    }

    pub fn destroy(&self) -> Result<Lifecycle> {
        let (lifecycle, disposal) = self.lock()?.items.destroy();
        disposal.run();
        Ok(lifecycle)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state_lossy().items.lifecycle()
    }

    /// Duplicates the frame with deep copies of its items.
    ///
    /// Scalar metadata is copied; the clone starts with an empty client mask
    /// and is not in use. Shallow clones are not supported.
    pub fn clone_frame(&self, shallow: bool) -> Result<FrameObject> {
        if shallow {
            return Err(FrameStoreError::NotImplemented("shallow frame clone"));
        }
        let (items, unique_id, reprocess_id, time_created_ms, is_dummy) = {
            let state = self.lock()?;
            (
                state.items.snapshot()?,
                state.unique_id,
                state.reprocess_id,
                state.time_created_ms,
                state.is_dummy,
            )
        };

        let items = ItemTable::deep_clone(items)?;
        let clone = Self::with_items(self.registry.clone(), items, unique_id);
        {
            let mut state = clone.lock()?;
            state.reprocess_id = reprocess_id;
            state.time_created_ms = time_created_ms;
            state.is_dummy = is_dummy;
        }
        Ok(clone)
    }

    /// Resolves an item id to its descriptor name, for diagnostics.
    pub fn item_name(&self, id: DescriptorId) -> Option<Arc<str>> {
        self.registry.name_of(id)
    }

    /// Hands the frame out again under a fresh unique id.
    pub(crate) fn activate(&self, unique_id: u64, is_dummy: bool) -> Result<()> {
        let mut state = self.lock()?;
        if state.in_use {
            return Err(FrameStoreError::invalid_state(format!(
                "frame {} is already in use",
                state.unique_id
            )));
        }
        state.unique_id = unique_id;
        state.reprocess_id = None;
        state.time_created_ms = now_ms();
        state.is_dummy = is_dummy;
        state.in_use = true;
        Ok(())
    }

    /// Returns the frame to the free state if it is reclaimable, clearing its
    /// items. Returns `false` and changes nothing otherwise.
    pub(crate) fn try_deactivate(&self) -> Result<bool> {
        let disposal = {
            let mut state = self.lock()?;
            if !state.in_use
                || !state.client_mask.is_empty()
                || state.items.outstanding_retains() > 0
            {
                return Ok(false);
            }
            let disposal = match state.items.lifecycle() {
                Lifecycle::Active => state.items.reset()?,
                // An explicitly destroyed frame has nothing left to drop; it
                // goes back with an empty table.
                Lifecycle::Destroyed => {
                    state.items = ItemTable::new();
                    Disposal::default()
                }
                Lifecycle::DestroyPending => return Ok(false),
            };
            state.in_use = false;
            disposal
        };
        disposal.run();
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, FrameState>> {
        self.state
            .lock()
            .map_err(|_| FrameStoreError::poisoned("frame"))
    }

    fn state_lossy(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FrameObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state_lossy();
        f.debug_struct("FrameObject")
            .field("unique_id", &state.unique_id)
            .field("reprocess_id", &state.reprocess_id)
            .field("client_mask", &state.client_mask)
            .field("in_use", &state.in_use)
            .field("is_dummy", &state.is_dummy)
            .field("items", &state.items)
            .finish()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Descriptor, ErrorKind};

    fn frame_with(names: &[&str]) -> (FrameObject, Vec<DescriptorId>) {
        let registry = Arc::new(DescriptorRegistry::new());
        let ids = names
            .iter()
            .map(|name| {
                registry
                    .register(&Descriptor::for_type::<u32>(name, "").unwrap())
                    .unwrap()
            })
            .collect();
        (FrameObject::new(registry, 7), ids)
    }

    #[test]
    fn client_mask_accumulates_and_gates_reclaim() {
        let (frame, _) = frame_with(&[]);
        assert!(frame.is_reclaimable());

        frame.set_client_mask(ClientRole::Capture).unwrap();
        let mask = frame.set_client_mask(ClientRole::AutoAlg).unwrap();
        assert_eq!(mask, ClientMask::CAPTURE | ClientMask::AUTO_ALG);
        assert!(!frame.is_reclaimable());

        frame.clear_client_mask(ClientRole::Capture).unwrap();
        assert!(!frame.is_reclaimable());
        frame.clear_client_mask(ClientRole::AutoAlg).unwrap();
        assert!(frame.is_reclaimable());
    }

    #[test]
    fn overlapping_owners_share_bits() {
        let (frame, _) = frame_with(&[]);
        frame.set_client_mask(ClientMask::ENCODER).unwrap();
        frame
            .set_client_mask([ClientRole::Encoder, ClientRole::Display].into_iter().collect::<ClientMask>())
            .unwrap();
        let mask = frame.clear_client_mask(ClientRole::Encoder).unwrap();
        assert_eq!(mask, ClientMask::DISPLAY);
    }

    #[test]
    fn retained_item_blocks_reclaim() {
        let (frame, ids) = frame_with(&["exposure"]);
        frame.insert(ids[0], 33_u32).unwrap();
        assert_eq!(*frame.get_as::<u32>(ids[0]).unwrap(), 33);
        assert!(!frame.is_reclaimable());
        frame.release(ids[0]).unwrap();
        assert!(frame.is_reclaimable());
    }

    #[test]
    fn clone_copies_metadata_but_not_owners() {
        let (frame, ids) = frame_with(&["exposure", "focus"]);
        frame.insert(ids[0], 1_u32).unwrap();
        frame.insert(ids[1], 2_u32).unwrap();
        frame.set_reprocess_id(Some(99)).unwrap();
        frame.set_dummy(true).unwrap();
        frame.set_client_mask(ClientMask::CAPTURE).unwrap();

        let clone = frame.clone_frame(false).unwrap();
        assert_eq!(clone.unique_id(), frame.unique_id());
        assert_eq!(clone.reprocess_id(), Some(99));
        assert_eq!(clone.time_created_ms(), frame.time_created_ms());
        assert!(clone.is_dummy());
        assert!(clone.client_mask().is_empty());
        assert!(!clone.in_use());
        assert_eq!(clone.item_ids().unwrap(), ids);
        assert_eq!(*clone.get_as::<u32>(ids[1]).unwrap(), 2);
    }

    #[test]
    fn shallow_frame_clone_is_not_implemented() {
        let (frame, _) = frame_with(&[]);
        assert_eq!(
            frame.clone_frame(true).unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
    }

    #[test]
    fn item_name_resolves_through_registry() {
        let (frame, ids) = frame_with(&["histogram"]);
        assert_eq!(frame.item_name(ids[0]).as_deref(), Some("histogram"));
        assert!(frame.item_name(DescriptorId::new(1000)).is_none());
    }

    #[test]
    fn deactivate_requires_idle_frame_and_clears_items() {
        let registry = Arc::new(DescriptorRegistry::new());
        let destroyed = Arc::new(AtomicUsize::new(0));
        let kind = Descriptor::named("stats", "").unwrap();
        let counter = destroyed.clone();
        kind.set_destroy_fn(Some(Arc::new(move |_: &(dyn Any + Send + Sync)| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        let id = registry.register(&kind).unwrap();
        let frame = FrameObject::new(registry, 1);

        frame.activate(1, false).unwrap();
        assert_eq!(
            frame.activate(2, false).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        frame.insert(id, vec![0_u8; 16]).unwrap();
        frame.set_client_mask(ClientMask::DISPLAY).unwrap();
        assert!(!frame.try_deactivate().unwrap());

        frame.clear_client_mask(ClientMask::DISPLAY).unwrap();
        assert!(frame.try_deactivate().unwrap());
        assert!(!frame.in_use());
        assert!(frame.is_valid(id).is_err());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
