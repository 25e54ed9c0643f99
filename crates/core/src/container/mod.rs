use std::{
    any::{type_name, Any},
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{Descriptor, DescriptorId, DescriptorRegistry, FrameStoreError, ItemValue, Result};

/// Lifecycle of an item container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Destruction was requested while items were still retained. It
    /// completes inside the `release` call that drains the last retain.
    DestroyPending,
    Destroyed,
}

/// How [`ItemContainer::clone_container`] duplicates values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Every value is copied through its descriptor's clone callback.
    Deep,
    /// Values would be shared between both containers. Not supported.
    Shallow,
}

enum SlotValue {
    Undefined,
    Valid(ItemValue),
    /// Reset while still retained; destroyed once the last retainer releases.
    Orphaned(ItemValue),
}

struct ItemSlot {
    descriptor: Arc<Descriptor>,
    value: SlotValue,
    retain_count: u32,
}

/// Values whose destroy callbacks are due. They are run by the caller once the
/// lock guarding the table has been released.
#[must_use]
#[derive(Default)]
pub(crate) struct Disposal(Vec<(Arc<Descriptor>, ItemValue)>);

impl Disposal {
    fn push(&mut self, descriptor: Arc<Descriptor>, value: ItemValue) {
        self.0.push((descriptor, value));
    }

    pub(crate) fn run(self) {
        for (descriptor, value) in self.0 {
            descriptor.destroy_value(&value);
            tracing::trace!(id = descriptor.id().get(), name = ?descriptor.name(), "item destroyed");
        }
    }
}

/// A valid item captured for cloning outside of the table lock.
pub(crate) struct ItemSnapshot {
    id: DescriptorId,
    descriptor: Arc<Descriptor>,
    value: ItemValue,
}

/// Sparse table of item slots keyed by descriptor id.
///
/// This holds the bookkeeping shared by [`ItemContainer`] and
/// [`FrameObject`](crate::FrameObject); the owner provides the lock.
pub(crate) struct ItemTable {
    slots: HashMap<DescriptorId, ItemSlot>,
    lifecycle: Lifecycle,
}

impl ItemTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            lifecycle: Lifecycle::Active,
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn insert(
        &mut self,
        registry: &DescriptorRegistry,
        id: DescriptorId,
        value: ItemValue,
    ) -> Result<()> {
        self.ensure_active("insert")?;
        if let Some(slot) = self.slots.get(&id) {
            match slot.value {
                SlotValue::Valid(_) => {
                    return Err(FrameStoreError::invalid_state(format!(
                        "item {id} already holds a valid value"
                    )))
                }
                _ if slot.retain_count > 0 => {
                    return Err(FrameStoreError::invalid_state(format!(
                        "item {id} is still retained {} time(s) from before a reset",
                        slot.retain_count
                    )))
                }
                _ => {}
            }
        }

        let descriptor = registry.lookup_by_id(id)?;
        if !self.slots.contains_key(&id) {
            self.slots.try_reserve(1)?;
        }
        self.slots.insert(
            id,
            ItemSlot {
                descriptor,
                value: SlotValue::Valid(value),
                retain_count: 0,
            },
        );
        Ok(())
    }

    /// Returns the value and counts one more retain on it.
    pub(crate) fn get(&mut self, id: DescriptorId) -> Result<ItemValue> {
        self.ensure_active("get")?;
        let (value, retain_count) = self.valid_entry(id)?;
        let value = value.clone();
        *retain_count = bump(id, *retain_count)?;
        tracing::trace!(id = id.get(), retain_count = *retain_count, "item get");
        Ok(value)
    }

    /// Like [`ItemTable::get`] but downcasts first; a type mismatch retains
    /// nothing.
    pub(crate) fn get_as<T>(&mut self, id: DescriptorId) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.ensure_active("get")?;
        let (value, retain_count) = self.valid_entry(id)?;
        let typed = value.clone().downcast::<T>().map_err(|_| {
            FrameStoreError::bad_value(format!("item {id} is not a `{}`", type_name::<T>()))
        })?;
        *retain_count = bump(id, *retain_count)?;
        Ok(typed)
    }

    pub(crate) fn retain(&mut self, id: DescriptorId) -> Result<u32> {
        self.ensure_active("retain")?;
        let (_, retain_count) = self.valid_entry(id)?;
        *retain_count = bump(id, *retain_count)?;
        tracing::trace!(id = id.get(), retain_count = *retain_count, "item retained");
        Ok(*retain_count)
    }

    /// Drops one retain. Completes a pending reset or destroy when this was
    /// the last outstanding retain involved.
    pub(crate) fn release(&mut self, id: DescriptorId) -> Result<Disposal> {
        if self.lifecycle == Lifecycle::Destroyed {
            return Err(FrameStoreError::invalid_state(format!(
                "cannot release item {id}: container is destroyed"
            )));
        }
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| FrameStoreError::bad_value(format!("no item {id} in container")))?;
        if slot.retain_count == 0 {
            return Err(FrameStoreError::invalid_state(format!(
                "item {id} released more often than it was retained"
            )));
        }
        slot.retain_count -= 1;
        tracing::trace!(id = id.get(), retain_count = slot.retain_count, "item released");

        let mut disposal = Disposal::default();
        if slot.retain_count == 0 {
            match std::mem::replace(&mut slot.value, SlotValue::Undefined) {
                SlotValue::Orphaned(value) => disposal.push(slot.descriptor.clone(), value),
                other => slot.value = other,
            }
        }

        if self.lifecycle == Lifecycle::DestroyPending && self.outstanding_retains() == 0 {
            tracing::debug!("last retain released, completing deferred destroy");
            self.finish_destroy(&mut disposal);
        }
        Ok(disposal)
    }

    pub(crate) fn is_valid(&self, id: DescriptorId) -> Result<()> {
        match self.slots.get(&id) {
            Some(ItemSlot {
                value: SlotValue::Valid(_),
                ..
            }) => Ok(()),
            _ => Err(FrameStoreError::bad_value(format!("item {id} is not valid"))),
        }
    }

    /// Marks every slot undefined. Unretained values are destroyed right away;
    /// retained ones are destroyed when their last retainer releases.
    pub(crate) fn reset(&mut self) -> Result<Disposal> {
        self.ensure_active("reset")?;
        let mut disposal = Disposal::default();
        for slot in self.slots.values_mut() {
            let value = std::mem::replace(&mut slot.value, SlotValue::Undefined);
            match value {
                SlotValue::Valid(value) if slot.retain_count == 0 => {
                    disposal.push(slot.descriptor.clone(), value);
                }
                SlotValue::Valid(value) => slot.value = SlotValue::Orphaned(value),
                other => slot.value = other,
            }
        }
        Ok(disposal)
    }

    /// Destroys the table now, or marks it pending while retains are held.
    pub(crate) fn destroy(&mut self) -> (Lifecycle, Disposal) {
        let mut disposal = Disposal::default();
        match self.lifecycle {
            Lifecycle::Active if self.outstanding_retains() > 0 => {
                tracing::debug!(
                    outstanding = self.outstanding_retains(),
                    "items still retained, deferring destroy"
                );
                self.lifecycle = Lifecycle::DestroyPending;
            }
            Lifecycle::Active => self.finish_destroy(&mut disposal),
            Lifecycle::DestroyPending | Lifecycle::Destroyed => {}
        }
        (self.lifecycle, disposal)
    }

    pub(crate) fn retain_count(&self, id: DescriptorId) -> Result<u32> {
        self.slots
            .get(&id)
            .map(|slot| slot.retain_count)
            .ok_or_else(|| FrameStoreError::bad_value(format!("no item {id} in container")))
    }

    /// Ids of the currently valid items, ascending.
    pub(crate) fn item_ids(&self) -> Vec<DescriptorId> {
        let mut ids: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.value, SlotValue::Valid(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn outstanding_retains(&self) -> u64 {
        self.slots
            .values()
            .map(|slot| u64::from(slot.retain_count))
            .sum()
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<ItemSnapshot>> {
        self.ensure_active("clone")?;
        let mut items: Vec<_> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| match &slot.value {
                SlotValue::Valid(value) => Some(ItemSnapshot {
                    id: *id,
                    descriptor: slot.descriptor.clone(),
                    value: value.clone(),
                }),
                _ => None,
            })
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    /// Builds a new table holding deep copies of `items`.
    ///
    /// On failure every copy made so far is handed to its destroy callback and
    /// nothing is returned.
    pub(crate) fn deep_clone(items: Vec<ItemSnapshot>) -> Result<Self> {
        let mut table = Self::new();
        for item in items {
            let copy = match item.descriptor.clone_value(&item.value) {
                Some(Ok(copy)) => copy,
                Some(Err(err)) => {
                    tracing::warn!(id = item.id.get(), error = %err, "clone callback failed, rolling back");
                    table.discard().run();
                    return Err(err);
                }
                None => {
                    tracing::warn!(
                        id = item.id.get(),
                        name = ?item.descriptor.name(),
                        "item kind has no clone callback, rolling back"
                    );
                    table.discard().run();
                    return Err(FrameStoreError::invalid_state(format!(
                        "item {} ({}) has no clone function",
                        item.id,
                        item.descriptor.name().as_deref().unwrap_or("unnamed")
                    )));
                }
            };

            if let Err(err) = table.slots.try_reserve(1) {
                // Not yet in the table, so the rollback would miss it.
                item.descriptor.destroy_value(&copy);
                table.discard().run();
                return Err(err.into());
            }
            table.slots.insert(
                item.id,
                ItemSlot {
                    descriptor: item.descriptor,
                    value: SlotValue::Valid(copy),
                    retain_count: 0,
                },
            );
        }
        Ok(table)
    }

    /// Takes every value not yet destroyed and marks the table destroyed.
    pub(crate) fn discard(&mut self) -> Disposal {
        let mut disposal = Disposal::default();
        if self.lifecycle != Lifecycle::Destroyed {
            self.finish_destroy(&mut disposal);
        }
        disposal
    }

    fn finish_destroy(&mut self, disposal: &mut Disposal) {
        for (_, slot) in self.slots.drain() {
            match slot.value {
                SlotValue::Valid(value) | SlotValue::Orphaned(value) => {
                    disposal.push(slot.descriptor, value)
                }
                SlotValue::Undefined => {}
            }
        }
        self.lifecycle = Lifecycle::Destroyed;
    }

    fn valid_entry(&mut self, id: DescriptorId) -> Result<(&ItemValue, &mut u32)> {
        match self.slots.get_mut(&id) {
            Some(ItemSlot {
                value: SlotValue::Valid(value),
                retain_count,
                ..
            }) => Ok((&*value, retain_count)),
            _ => Err(FrameStoreError::bad_value(format!("item {id} is not valid"))),
        }
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Active => Ok(()),
            other => Err(FrameStoreError::invalid_state(format!(
                "cannot {operation}: container is {other:?}"
            ))),
        }
    }
}

fn bump(id: DescriptorId, retain_count: u32) -> Result<u32> {
    retain_count
        .checked_add(1)
        .ok_or_else(|| FrameStoreError::invalid_state(format!("item {id} retain count overflow")))
}

impl Drop for ItemTable {
    fn drop(&mut self) {
        self.discard().run();
    }
}

impl fmt::Debug for ItemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemTable")
            .field("lifecycle", &self.lifecycle)
            .field("items", &self.item_ids())
            .field("outstanding_retains", &self.outstanding_retains())
            .finish()
    }
}

/// Thread-safe container of typed per-frame values.
///
/// Every value read through [`ItemContainer::get`] is counted; it must be
/// paired with a [`ItemContainer::release`]. Destroying the container while
/// values are retained defers the destroy callbacks until the last release.
pub struct ItemContainer {
    registry: Arc<DescriptorRegistry>,
    table: Mutex<ItemTable>,
}

impl ItemContainer {
    /// Creates an empty container resolving ids against `registry`.
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self::with_table(registry, ItemTable::new())
    }

    fn with_table(registry: Arc<DescriptorRegistry>, table: ItemTable) -> Self {
        Self {
            registry,
            table: Mutex::new(table),
        }
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    /// Stores `value` under `id`. Fails with `InvalidState` while the slot
    /// still holds a valid value.
    pub fn insert<T>(&self, id: DescriptorId, value: T) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        self.insert_value(id, Arc::new(value))
    }

    pub fn insert_value(&self, id: DescriptorId, value: ItemValue) -> Result<()> {
        self.lock()?.insert(&self.registry, id, value)
    }

    /// Returns the value stored under `id` and retains it.
    pub fn get(&self, id: DescriptorId) -> Result<ItemValue> {
        self.lock()?.get(id)
    }

    /// Typed variant of [`ItemContainer::get`].
    pub fn get_as<T>(&self, id: DescriptorId) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.lock()?.get_as(id)
    }

    /// Retains the value under `id` without reading it. Returns the new count.
    pub fn retain(&self, id: DescriptorId) -> Result<u32> {
        self.lock()?.retain(id)
    }

    pub fn release(&self, id: DescriptorId) -> Result<()> {
        let disposal = self.lock()?.release(id)?;
        disposal.run();
        Ok(())
    }

    pub fn is_valid(&self, id: DescriptorId) -> Result<()> {
        self.lock()?.is_valid(id)
    }

    pub fn reset(&self) -> Result<()> {
        let disposal = self.lock()?.reset()?;
        disposal.run();
        Ok(())
    }

    /// Requests destruction. Returns [`Lifecycle::DestroyPending`] when values
    /// are still retained, [`Lifecycle::Destroyed`] otherwise.
    pub fn destroy(&self) -> Result<Lifecycle> {
        let (lifecycle, disposal) = self.lock()?.destroy();
        disposal.run();
        Ok(lifecycle)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lifecycle()
    }

    pub fn retain_count(&self, id: DescriptorId) -> Result<u32> {
        self.lock()?.retain_count(id)
    }

    pub fn outstanding_retains(&self) -> Result<u64> {
        Ok(self.lock()?.outstanding_retains())
    }

    pub fn item_ids(&self) -> Result<Vec<DescriptorId>> {
        Ok(self.lock()?.item_ids())
    }

    /// Duplicates the container. Only [`CloneMode::Deep`] is supported.
    pub fn clone_container(&self, mode: CloneMode) -> Result<ItemContainer> {
        if mode == CloneMode::Shallow {
            return Err(FrameStoreError::NotImplemented("shallow container clone"));
        }
        let items = self.lock()?.snapshot()?;
        let table = ItemTable::deep_clone(items)?;
        Ok(Self::with_table(self.registry.clone(), table))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ItemTable>> {
        self.table
            .lock()
            .map_err(|_| FrameStoreError::poisoned("item container"))
    }
}

impl fmt::Debug for ItemContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table.lock() {
            Ok(table) => f.debug_struct("ItemContainer").field("table", &*table).finish(),
            Err(_) => f.debug_struct("ItemContainer").finish_non_exhaustive(),
        }
    }
}
