//! Function service cache
//!
//! Concurrency-safe map from a function identity to the backend serving it.
//! Each operation touches a single entry and is atomic with respect to every
//! other operation on that entry, so a backend can never be deleted between
//! the moment a dispatcher refreshes it and the moment it is used.

use std::sync::Arc;
use std::time::Duration;

use api_types::EnvironmentReference;
use chrono::DateTime;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::clock::SystemClock;
use super::clock::TimeSource;
use super::error::CacheError;
use super::types::FuncSvc;
use super::types::FunctionIdentity;

#[derive(Debug)]
struct CacheEntry {
    svc: FuncSvc,
    active: usize,
}

type Entries = DashMap<FunctionIdentity, CacheEntry>;

pub struct FunctionServiceCache {
    entries: Arc<Entries>,
    /// backend address -> function, kept in step with `entries`
    by_address: DashMap<String, FunctionIdentity>,
    clock: Arc<dyn TimeSource>,
}

impl Default for FunctionServiceCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the instant before which an entry counts as idle, or `None` when
/// the threshold reaches beyond the representable range.
fn idle_cutoff(now: DateTime<Utc>, idle: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(idle)
        .ok()
        .and_then(|idle| now.checked_sub_signed(idle))
}

impl FunctionServiceCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            by_address: DashMap::new(),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Registers a backend. When one is already registered for the same
    /// function, that one wins and is returned inside the error.
    pub fn put(&self, svc: FuncSvc) -> Result<(), CacheError> {
        match self.entries.entry(svc.function.clone()) {
            Entry::Occupied(existing) => Err(CacheError::Conflict {
                function: svc.function,
                existing: Box::new(existing.get().svc.clone()),
            }),
            Entry::Vacant(slot) => {
                self.by_address
                    .insert(svc.address.clone(), svc.function.clone());
                debug!(function = %svc.function, address = %svc.address, "Cached function service");
                slot.insert(CacheEntry { svc, active: 0 });
                Ok(())
            }
        }
    }

    /// Registers a backend, displacing any existing one.
    pub fn replace(&self, svc: FuncSvc) -> Option<FuncSvc> {
        let address = svc.address.clone();
        self.by_address.insert(address.clone(), svc.function.clone());
        let displaced = self
            .entries
            .insert(svc.function.clone(), CacheEntry { svc, active: 0 })
            .map(|entry| entry.svc);
        if let Some(old) = displaced.as_ref().filter(|old| old.address != address) {
            self.forget_address(old);
        }
        displaced
    }

    pub fn lookup(&self, function: &FunctionIdentity) -> Option<FuncSvc> {
        self.entries.get(function).map(|entry| entry.svc.clone())
    }

    pub fn lookup_by_address(&self, address: &str) -> Option<FuncSvc> {
        let function = self.by_address.get(address)?.value().clone();
        self.lookup(&function)
            .filter(|svc| svc.address == address)
    }

    /// Refreshes the last-access time of a function's backend.
    pub fn touch(&self, function: &FunctionIdentity) -> Result<(), CacheError> {
        let now = self.clock.now();
        match self.entries.get_mut(function) {
            Some(mut entry) => {
                entry.svc.atime = now;
                Ok(())
            }
            None => Err(CacheError::NotFound {
                function: function.clone(),
            }),
        }
    }

    pub fn touch_by_address(&self, address: &str) -> Result<(), CacheError> {
        let not_found = || CacheError::AddressNotFound {
            address: address.to_string(),
        };
        let function = self
            .by_address
            .get(address)
            .map(|function| function.value().clone())
            .ok_or_else(not_found)?;
        let now = self.clock.now();
        match self.entries.get_mut(&function) {
            Some(mut entry) if entry.svc.address == address => {
                entry.svc.atime = now;
                Ok(())
            }
            _ => Err(not_found()),
        }
    }

    /// Marks a backend as serving a request until the guard is dropped.
    pub fn acquire(&self, function: &FunctionIdentity) -> Result<InUseGuard, CacheError> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .get_mut(function)
            .ok_or_else(|| CacheError::NotFound {
                function: function.clone(),
            })?;
        entry.active += 1;
        entry.svc.atime = now;
        Ok(InUseGuard {
            entries: self.entries.clone(),
            clock: self.clock.clone(),
            function: function.clone(),
            backend_id: entry.svc.backend_id,
        })
    }

    /// Snapshot of backends idle for longer than `idle`, optionally limited
    /// to one environment.
    pub fn list_older_than(
        &self,
        environment: Option<&EnvironmentReference>,
        idle: Duration,
    ) -> Vec<FuncSvc> {
        let Some(cutoff) = idle_cutoff(self.clock.now(), idle) else {
            return Vec::new();
        };
        self.entries
            .iter()
            .filter(|entry| entry.svc.atime < cutoff)
            .filter(|entry| environment.map_or(true, |env| entry.svc.environment == *env))
            .map(|entry| entry.svc.clone())
            .collect()
    }

    /// Removes `svc` if it is still the registered backend, nothing holds it
    /// and it is still idle. `Ok(false)` means it was refreshed, acquired or
    /// replaced since the caller's snapshot.
    pub fn delete_if_idle_and_unused(
        &self,
        svc: &FuncSvc,
        idle: Duration,
    ) -> Result<bool, CacheError> {
        let not_found = || CacheError::NotFound {
            function: svc.function.clone(),
        };
        let Some(cutoff) = idle_cutoff(self.clock.now(), idle) else {
            return if self.entries.contains_key(&svc.function) {
                Ok(false)
            } else {
                Err(not_found())
            };
        };

        let removed = self.entries.remove_if(&svc.function, |_, entry| {
            entry.svc.backend_id == svc.backend_id && entry.active == 0 && entry.svc.atime < cutoff
        });
        match removed {
            Some((_, entry)) => {
                self.forget_address(&entry.svc);
                Ok(true)
            }
            None if self.entries.contains_key(&svc.function) => Ok(false),
            None => Err(not_found()),
        }
    }

    pub fn delete(&self, function: &FunctionIdentity) -> Option<FuncSvc> {
        let (_, entry) = self.entries.remove(function)?;
        self.forget_address(&entry.svc);
        Some(entry.svc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn forget_address(&self, svc: &FuncSvc) {
        self.by_address
            .remove_if(&svc.address, |_, function| *function == svc.function);
    }
}

/// Holds a backend in use. Dropping the guard releases it and counts as an
/// access.
pub struct InUseGuard {
    entries: Arc<Entries>,
    clock: Arc<dyn TimeSource>,
    function: FunctionIdentity,
    backend_id: Uuid,
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        let now = self.clock.now();
        if let Some(mut entry) = self.entries.get_mut(&self.function) {
            if entry.svc.backend_id == self.backend_id {
                entry.active = entry.active.saturating_sub(1);
                entry.svc.atime = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use api_types::ExecutorType;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::fscache::ManualClock;
    use crate::k8s::BackendKind;
    use crate::k8s::KubeObjectRef;

    const IDLE: Duration = Duration::from_secs(120);

    fn env(name: &str) -> EnvironmentReference {
        EnvironmentReference {
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn svc(cache: &FunctionServiceCache, name: &str, address: &str) -> FuncSvc {
        FuncSvc::new(
            FunctionIdentity::new(name, "default", format!("uid-{name}")),
            env("python"),
            address,
            vec![KubeObjectRef::of(BackendKind::Pod, "fission-function", address)],
            ExecutorType::Poolmgr,
            cache.now(),
        )
    }

    fn cache_with_clock() -> (FunctionServiceCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (FunctionServiceCache::with_clock(clock.clone()), clock)
    }

    #[test]
    fn concurrent_put_keeps_exactly_one_backend() {
        let cache = FunctionServiceCache::new();
        let barrier = Barrier::new(8);

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let cache = &cache;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let candidate = svc(cache, "hello", &format!("10.0.0.{i}:8888"));
                        barrier.wait();
                        cache.put(candidate)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let winners = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(winners, 1);
        assert_eq!(cache.len(), 1);

        let survivor = cache
            .lookup(&FunctionIdentity::new("hello", "default", "uid-hello"))
            .unwrap();
        for result in results {
            if let Err(CacheError::Conflict { existing, .. }) = result {
                assert_eq!(existing.backend_id, survivor.backend_id);
            }
        }
    }

    #[test]
    fn touch_after_snapshot_prevents_deletion() {
        let (cache, clock) = cache_with_clock();
        let entry = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(entry.clone()).unwrap();
        clock.advance(Duration::from_secs(180));

        let candidates = cache.list_older_than(None, IDLE);
        assert_eq!(candidates.len(), 1);

        cache.touch(&entry.function).unwrap();
        assert!(!cache.delete_if_idle_and_unused(&candidates[0], IDLE).unwrap());
        assert!(cache.lookup(&entry.function).is_some());
    }

    #[test]
    fn idle_entry_is_deleted_once() {
        let (cache, clock) = cache_with_clock();
        let entry = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(entry.clone()).unwrap();
        clock.advance(Duration::from_secs(121));

        assert!(cache.delete_if_idle_and_unused(&entry, IDLE).unwrap());
        assert!(matches!(
            cache.delete_if_idle_and_unused(&entry, IDLE),
            Err(CacheError::NotFound { .. })
        ));
        assert!(cache.lookup_by_address("10.0.0.1:8888").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn in_use_backend_is_not_deleted() {
        let (cache, clock) = cache_with_clock();
        let entry = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(entry.clone()).unwrap();

        let guard = cache.acquire(&entry.function).unwrap();
        clock.advance(Duration::from_secs(600));
        assert!(!cache.delete_if_idle_and_unused(&entry, IDLE).unwrap());

        drop(guard);
        // releasing counts as an access
        assert!(!cache.delete_if_idle_and_unused(&entry, IDLE).unwrap());
        clock.advance(Duration::from_secs(121));
        assert!(cache.delete_if_idle_and_unused(&entry, IDLE).unwrap());
    }

    #[test]
    fn replaced_backend_is_not_deleted_through_stale_snapshot() {
        let (cache, clock) = cache_with_clock();
        let old = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(old.clone()).unwrap();

        let new = svc(&cache, "hello", "10.0.0.2:8888");
        let displaced = cache.replace(new.clone()).unwrap();
        assert_eq!(displaced.backend_id, old.backend_id);
        clock.advance(Duration::from_secs(300));

        assert!(!cache.delete_if_idle_and_unused(&old, IDLE).unwrap());
        assert!(cache.lookup_by_address("10.0.0.1:8888").is_none());
        assert_eq!(
            cache.lookup_by_address("10.0.0.2:8888").map(|svc| svc.backend_id),
            Some(new.backend_id)
        );
    }

    #[test]
    fn list_older_than_filters_by_environment() {
        let (cache, clock) = cache_with_clock();
        let python = svc(&cache, "a", "10.0.0.1:8888");
        let mut node = svc(&cache, "b", "10.0.0.2:8888");
        node.environment = env("nodejs");
        cache.put(python.clone()).unwrap();
        cache.put(node).unwrap();
        clock.advance(Duration::from_secs(200));

        let listed = cache.list_older_than(Some(&env("python")), IDLE);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].function, python.function);
        assert_eq!(cache.list_older_than(None, IDLE).len(), 2);
        assert!(cache.list_older_than(None, Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn touch_by_address_refreshes_entry() {
        let (cache, clock) = cache_with_clock();
        let entry = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(entry.clone()).unwrap();
        clock.advance(Duration::from_secs(200));

        cache.touch_by_address("10.0.0.1:8888").unwrap();
        assert!(cache.list_older_than(None, IDLE).is_empty());
        let touched = cache.lookup(&entry.function).unwrap();
        assert_eq!(touched.ctime, entry.ctime);
        assert_eq!(touched.atime, cache.now());
        assert!(matches!(
            cache.touch_by_address("10.9.9.9:8888"),
            Err(CacheError::AddressNotFound { .. })
        ));
        assert!(matches!(
            cache.touch(&FunctionIdentity::new("missing", "default", "x")),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_returns_removed_backend() {
        let cache = FunctionServiceCache::new();
        let entry = svc(&cache, "hello", "10.0.0.1:8888");
        cache.put(entry.clone()).unwrap();

        assert_eq!(cache.delete(&entry.function), Some(entry.clone()));
        assert_eq!(cache.delete(&entry.function), None);
    }
}
