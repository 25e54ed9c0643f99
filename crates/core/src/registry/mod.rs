use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{Descriptor, DescriptorId, FrameStoreError, Result};

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<Arc<str>, DescriptorId>,
    by_id: HashMap<DescriptorId, Arc<Descriptor>>,
    last_id: u32,
}

/// Set of registered descriptors, addressable by name and by id.
///
/// Registration is expected to happen during setup; lookups may then run
/// concurrently from any number of threads.
#[derive(Default)]
pub struct DescriptorRegistry {
    inner: RwLock<RegistryInner>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor` and returns its newly assigned id.
    ///
    /// Fails with `BadValue` when another descriptor already uses the same
    /// name and with `InvalidState` when the descriptor has no name or is
    /// already registered. The registry is unchanged on failure.
    pub fn register(&self, descriptor: &Arc<Descriptor>) -> Result<DescriptorId> {
        let mut inner = self.write()?;
        let id = descriptor.bind(|name| {
            if inner.by_name.contains_key(name) {
                return Err(FrameStoreError::bad_value(format!(
                    "descriptor name `{name}` is already registered"
                )));
            }
            let next = inner
                .last_id
                .checked_add(1)
                .ok_or_else(|| FrameStoreError::invalid_state("descriptor id space exhausted"))?;
            inner.by_name.try_reserve(1)?;
            inner.by_id.try_reserve(1)?;

            let id = DescriptorId::new(next);
            inner.by_name.insert(name.clone(), id);
            inner.by_id.insert(id, descriptor.clone());
            inner.last_id = next;
            Ok(id)
        })?;

        tracing::debug!(id = id.get(), name = ?descriptor.name(), "descriptor registered");
        Ok(id)
    }

    /// Removes the registry's bookkeeping for `descriptor`. The caller becomes
    /// responsible for destroying it.
    pub fn unregister(&self, descriptor: &Descriptor) -> Result<()> {
        let mut inner = self.write()?;
        let id = descriptor.id();
        let registered_here = inner
            .by_id
            .get(&id)
            .is_some_and(|known| std::ptr::eq(Arc::as_ptr(known), descriptor));
        if !registered_here {
            return Err(FrameStoreError::bad_value(format!(
                "descriptor {id} is not registered with this registry"
            )));
        }

        inner.by_id.remove(&id);
        if let Some(name) = descriptor.name() {
            inner.by_name.remove(&name);
        }
        descriptor.unbind();
        tracing::debug!(id = id.get(), name = ?descriptor.name(), "descriptor unregistered");
        Ok(())
    }

    pub fn lookup_by_id(&self, id: DescriptorId) -> Result<Arc<Descriptor>> {
        if !id.is_valid() {
            return Err(FrameStoreError::bad_parameter("descriptor id 0 is invalid"));
        }
        self.read()?
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| FrameStoreError::bad_value(format!("unknown descriptor {id}")))
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<Arc<Descriptor>> {
        if name.is_empty() {
            return Err(FrameStoreError::bad_parameter("descriptor name is empty"));
        }
        let inner = self.read()?;
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
            .ok_or_else(|| FrameStoreError::bad_value(format!("unknown descriptor `{name}`")))
    }

    /// Resolves an id to its descriptor name, for diagnostics.
    pub fn name_of(&self, id: DescriptorId) -> Option<Arc<str>> {
        self.lookup_by_id(id).ok().and_then(|descriptor| descriptor.name())
    }

    /// Snapshot of every registered descriptor ordered by id.
    pub fn descriptors(&self) -> Vec<Arc<Descriptor>> {
        let inner = self.read_lossy();
        let mut descriptors: Vec<_> = inner.by_id.values().cloned().collect();
        descriptors.sort_by_key(|descriptor| descriptor.id());
        descriptors
    }

    pub fn len(&self) -> usize {
        self.read_lossy().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches and releases every descriptor still registered. The registry
    /// stays usable and keeps counting ids from where it left off.
    pub fn destroy(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Self::detach_all(&mut inner);
    }

    fn detach_all(inner: &mut RegistryInner) {
        inner.by_name.clear();
        for (id, descriptor) in inner.by_id.drain() {
            descriptor.unbind();
            tracing::debug!(id = id.get(), name = ?descriptor.name(), "descriptor destroyed with registry");
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| FrameStoreError::poisoned("descriptor registry"))
    }

    fn read_lossy(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| FrameStoreError::poisoned("descriptor registry"))
    }
}

impl Drop for DescriptorRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::detach_all(inner);
    }
}

impl fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("descriptors", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn descriptor(name: &str) -> Arc<Descriptor> {
        Descriptor::named(name, "test kind").unwrap()
    }

    #[test]
    fn assigns_distinct_resolvable_ids() {
        let registry = DescriptorRegistry::new();
        let names = ["alpha", "beta", "gamma", "delta"];
        let mut ids = Vec::new();
        for name in names {
            let id = registry.register(&descriptor(name)).unwrap();
            assert!(id.is_valid());
            ids.push(id);
        }

        for (name, id) in names.iter().zip(&ids) {
            assert_eq!(registry.lookup_by_id(*id).unwrap().name().as_deref(), Some(*name));
            assert_eq!(registry.lookup_by_name(name).unwrap().id(), *id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), names.len());
    }

    #[test]
    fn duplicate_name_leaves_registry_unchanged() {
        let registry = DescriptorRegistry::new();
        let first = descriptor("exposure");
        let id = registry.register(&first).unwrap();

        let second = descriptor("exposure");
        let err = registry.register(&second).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadValue);
        assert_eq!(second.id(), DescriptorId::INVALID);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup_by_name("exposure").unwrap(), &first));
        assert_eq!(registry.lookup_by_id(id).unwrap().id(), id);
    }

    #[test]
    fn unnamed_descriptor_is_invalid_state() {
        let registry = DescriptorRegistry::new();
        let err = registry.register(&Descriptor::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(registry.is_empty());
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = DescriptorRegistry::new();
        let kind = descriptor("focus");
        registry.register(&kind).unwrap();
        let err = registry.register(&kind).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn lookup_errors() {
        let registry = DescriptorRegistry::new();
        assert_eq!(
            registry.lookup_by_id(DescriptorId::INVALID).unwrap_err().kind(),
            ErrorKind::BadParameter
        );
        assert_eq!(
            registry.lookup_by_id(DescriptorId::new(9)).unwrap_err().kind(),
            ErrorKind::BadValue
        );
        assert_eq!(
            registry.lookup_by_name("").unwrap_err().kind(),
            ErrorKind::BadParameter
        );
        assert_eq!(
            registry.lookup_by_name("missing").unwrap_err().kind(),
            ErrorKind::BadValue
        );
    }

    #[test]
    fn unregister_detaches_and_ids_are_not_reused() {
        let registry = DescriptorRegistry::new();
        let kind = descriptor("histogram");
        let first = registry.register(&kind).unwrap();

        registry.unregister(&kind).unwrap();
        assert!(!kind.is_registered());
        assert!(registry.lookup_by_name("histogram").is_err());
        assert_eq!(
            registry.unregister(&kind).unwrap_err().kind(),
            ErrorKind::BadValue
        );

        let second = registry.register(&kind).unwrap();
        assert!(second > first);
    }

    #[test]
    fn unregister_rejects_foreign_descriptor() {
        let ours = DescriptorRegistry::new();
        let theirs = DescriptorRegistry::new();
        let kind = descriptor("faces");
        theirs.register(&kind).unwrap();
        assert_eq!(ours.unregister(&kind).unwrap_err().kind(), ErrorKind::BadValue);
        assert!(kind.is_registered());
    }

    #[test]
    fn registered_descriptor_cannot_be_renamed() {
        let registry = DescriptorRegistry::new();
        let kind = descriptor("gains");
        registry.register(&kind).unwrap();
        assert_eq!(kind.set_name("other").unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn direct_destroy_of_registered_descriptor_is_refused() {
        let registry = DescriptorRegistry::new();
        let kind = descriptor("state");
        let id = registry.register(&kind).unwrap();

        kind.clone().destroy();
        assert!(kind.is_registered());
        assert!(registry.lookup_by_id(id).is_ok());
    }

    #[test]
    fn dropping_registry_detaches_remaining_descriptors() {
        let kind = descriptor("settings");
        {
            let registry = DescriptorRegistry::new();
            registry.register(&kind).unwrap();
            assert_eq!(Arc::strong_count(&kind), 2);
        }
        assert!(!kind.is_registered());
        assert_eq!(Arc::strong_count(&kind), 1);
    }

    #[test]
    fn descriptors_are_listed_by_id() {
        let registry = DescriptorRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register(&descriptor(name)).unwrap();
        }
        let names: Vec<_> = registry
            .descriptors()
            .iter()
            .map(|d| d.name().unwrap().to_string())
            .collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert_eq!(registry.name_of(DescriptorId::new(2)).as_deref(), Some("a"));
    }
}
