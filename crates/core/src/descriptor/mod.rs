use std::{
    any::{type_name, Any},
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use crate::{FrameStoreError, Result};

/// Shared, type-erased value stored in an item slot.
pub type ItemValue = Arc<dyn Any + Send + Sync>;

/// Deep-copies a value of the descriptor's kind. Must return a fresh value and
/// produce nothing on failure.
pub type CloneFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<ItemValue> + Send + Sync>;

/// Releases everything a value of the descriptor's kind owns. Cannot fail.
pub type DestroyFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// Identifier assigned to a [`Descriptor`] by the registry it is registered
/// with. Zero is never handed out and marks "not registered".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DescriptorId(u32);

impl DescriptorId {
    pub const INVALID: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default)]
struct DescriptorState {
    name: Option<Arc<str>>,
    description: Option<Arc<str>>,
    clone_fn: Option<CloneFn>,
    destroy_fn: Option<DestroyFn>,
}

/// Metadata describing one kind of per-frame value.
///
/// Descriptors are shared as `Arc<Descriptor>`: the registry keeps one handle
/// while the descriptor is registered, item slots keep another so that values
/// can still be destroyed after the kind was unregistered.
pub struct Descriptor {
    // Written only while `state` is write-locked.
    id: AtomicU32,
    state: RwLock<DescriptorState>,
}

impl Descriptor {
    /// Creates an unnamed descriptor without callbacks.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU32::new(0),
            state: RwLock::new(DescriptorState::default()),
        })
    }

    /// Creates a descriptor with its name and description already set.
    pub fn named(name: &str, description: &str) -> Result<Arc<Self>> {
        let descriptor = Self::new();
        descriptor.set_name(name)?;
        descriptor.set_description(description)?;
        Ok(descriptor)
    }

    /// Creates a descriptor for values of type `T`, with a clone callback that
    /// deep-copies through `T::clone`.
    pub fn for_type<T>(name: &str, description: &str) -> Result<Arc<Self>>
    where
        T: Any + Clone + Send + Sync,
    {
        let descriptor = Self::named(name, description)?;
        descriptor.set_clone_fn(Some(clone_fn_for::<T>()))?;
        Ok(descriptor)
    }

    /// Returns the assigned id, or [`DescriptorId::INVALID`] when the
    /// descriptor is not registered.
    pub fn id(&self) -> DescriptorId {
        DescriptorId(self.id.load(Ordering::Acquire))
    }

    pub fn is_registered(&self) -> bool {
        self.id().is_valid()
    }

    /// Sets the unique name. The string is copied.
    pub fn set_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FrameStoreError::bad_parameter("descriptor name is empty"));
        }
        let mut state = self.write()?;
        if self.is_registered() {
            return Err(FrameStoreError::invalid_state(format!(
                "cannot rename registered descriptor {}",
                self.id()
            )));
        }
        state.name = Some(Arc::from(name));
        Ok(())
    }

    pub fn name(&self) -> Option<Arc<str>> {
        self.read().name.clone()
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.write()?.description = Some(Arc::from(description));
        Ok(())
    }

    pub fn description(&self) -> Option<Arc<str>> {
        self.read().description.clone()
    }

    /// Installs the deep-copy callback. `None` is rejected with `BadValue`.
    pub fn set_clone_fn(&self, clone_fn: Option<CloneFn>) -> Result<()> {
        let clone_fn =
            clone_fn.ok_or_else(|| FrameStoreError::bad_value("clone function is null"))?;
        self.write()?.clone_fn = Some(clone_fn);
        Ok(())
    }

    /// Installs the destroy callback. `None` is rejected with `BadValue`.
    pub fn set_destroy_fn(&self, destroy_fn: Option<DestroyFn>) -> Result<()> {
        let destroy_fn =
            destroy_fn.ok_or_else(|| FrameStoreError::bad_value("destroy function is null"))?;
        self.write()?.destroy_fn = Some(destroy_fn);
        Ok(())
    }

    pub fn has_clone_fn(&self) -> bool {
        self.read().clone_fn.is_some()
    }

    pub fn has_destroy_fn(&self) -> bool {
        self.read().destroy_fn.is_some()
    }

    /// Destroys a descriptor the caller owns.
    ///
    /// A descriptor that is still registered is left alone and a warning is
    /// logged; unregister it first.
    pub fn destroy(self: Arc<Self>) {
        if self.is_registered() {
            tracing::warn!(
                id = self.id().get(),
                name = ?self.name(),
                "refusing to destroy a descriptor that is still registered"
            );
            return;
        }
        tracing::debug!(name = ?self.name(), "descriptor destroyed");
    }

    /// Runs the clone callback. `None` when the kind has no clone callback.
    pub(crate) fn clone_value(&self, value: &ItemValue) -> Option<Result<ItemValue>> {
        let clone_fn = self.read().clone_fn.clone()?;
        Some(clone_fn(value.as_ref()))
    }

    /// Runs the destroy callback, if any.
    pub(crate) fn destroy_value(&self, value: &ItemValue) {
        let destroy_fn = self.read().destroy_fn.clone();
        if let Some(destroy_fn) = destroy_fn {
            destroy_fn(value.as_ref());
        }
    }

    /// Assigns an id while the descriptor's state is locked. `assign` receives
    /// the descriptor's name and returns the id to bind; nothing changes when
    /// it fails.
    pub(crate) fn bind<F>(&self, assign: F) -> Result<DescriptorId>
    where
        F: FnOnce(&Arc<str>) -> Result<DescriptorId>,
    {
        let state = self.write()?;
        let name = state
            .name
            .as_ref()
            .ok_or_else(|| FrameStoreError::invalid_state("descriptor name is not set"))?;
        if self.is_registered() {
            return Err(FrameStoreError::invalid_state(format!(
                "descriptor `{name}` is already registered as {}",
                self.id()
            )));
        }
        let id = assign(name)?;
        self.id.store(id.get(), Ordering::Release);
        Ok(id)
    }

    pub(crate) fn unbind(&self) {
        let _state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.id.store(0, Ordering::Release);
    }

    fn read(&self) -> RwLockReadGuard<'_, DescriptorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DescriptorState>> {
        self.state
            .write()
            .map_err(|_| FrameStoreError::poisoned("descriptor"))
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Descriptor")
            .field("id", &self.id())
            .field("name", &state.name)
            .field("clone_fn", &state.clone_fn.is_some())
            .field("destroy_fn", &state.destroy_fn.is_some())
            .finish()
    }
}

/// Builds a clone callback that downcasts to `T` and clones it.
pub fn clone_fn_for<T>() -> CloneFn
where
    T: Any + Clone + Send + Sync,
{
    Arc::new(|value: &(dyn Any + Send + Sync)| {
        value
            .downcast_ref::<T>()
            .map(|value| Arc::new(value.clone()) as ItemValue)
            .ok_or_else(|| {
                FrameStoreError::bad_value(format!("value is not a `{}`", type_name::<T>()))
            })
    })
}
