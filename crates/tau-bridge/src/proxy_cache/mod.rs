//! Proxy identity cache.
//!
//! When an object crosses the boundary, the receiving side gets a proxy that
//! forwards calls back. Crossing the *same* object again must yield the *same*
//! proxy for as long as that proxy is alive, otherwise reference-equality
//! protocols on the receiving side (add/remove listener pairs) break.
//!
//! The cache maps `(InterfaceTag, identity)` to a weak proxy reference. It
//! never owns a proxy: once the last external reference is dropped the proxy
//! is reclaimed, and its entry is pruned either lazily (found expired on the
//! next lookup) or eagerly (the proxy's [`ProxyRegistration`] calls
//! [`ProxyCache::remove`] from its destructor).
//!
//! # Locking
//!
//! One mutex per cache instance. It is never held while a proxy is dropped:
//! a proxy's destructor calls back into `remove`. Under
//! [`AllocPolicy::Locked`] the allocator runs inside the critical section;
//! under [`AllocPolicy::Optimistic`] it runs outside and the loser of a race
//! discards its proxy.
//!
//! # Globals
//!
//! [`native_to_host`] and [`host_to_native`] are the process-wide caches, one
//! per direction, built on first use and never torn down. A registration holds
//! the cache's shared state, so teardown order of other globals is irrelevant.

mod boundary;

pub use boundary::{
    Boundary, ForeignRef, ForeignRefTable, HostToNative, Identify, InterfaceTag, NativeHandle,
    NativeToHost, ObjectId, ProxyRef, WeakProxyRef,
};

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::{AllocPolicy, CacheConfig};
use crate::error::CacheError;
use crate::sync::lock;

type Key<B> = (InterfaceTag, <B as Boundary>::Identity);

struct Inner<B: Boundary> {
    map: Mutex<HashMap<Key<B>, B::WeakProxy>>,
    policy: AllocPolicy,
}

// =============================================================================
// ProxyCache
// =============================================================================

/// Weak identity map for one boundary direction. Clones share state.
pub struct ProxyCache<B: Boundary> {
    inner: Arc<Inner<B>>,
}

impl<B: Boundary> Clone for ProxyCache<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Boundary> Default for ProxyCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Boundary> fmt::Debug for ProxyCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCache")
            .field("direction", &type_name::<B>())
            .field("policy", &self.inner.policy)
            .field("entries", &self.len())
            .finish()
    }
}

impl<B: Boundary> ProxyCache<B> {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                map: Mutex::new(HashMap::with_capacity(config.initial_capacity)),
                policy: config.alloc_policy,
            }),
        }
    }

    pub fn policy(&self) -> AllocPolicy {
        self.inner.policy
    }

    /// Return the live proxy for `(tag, identity-of(handle))`, or allocate one.
    ///
    /// `allocate` builds the proxy and reports the identity to index it under.
    /// Its error is returned unchanged; nothing is registered and nothing is
    /// retried.
    pub fn get<H, E, F>(&self, tag: InterfaceTag, handle: &H, allocate: F) -> Result<B::Proxy, E>
    where
        H: Identify<B::Identity> + ?Sized,
        F: FnOnce(&H) -> Result<(B::Proxy, B::Identity), E>,
    {
        let key = (tag, handle.identity());

        match self.inner.policy {
            AllocPolicy::Locked => {
                let mut map = lock(&self.inner.map);
                if let Some(existing) = Self::lookup(&mut map, &key) {
                    return Ok(existing);
                }
                let (proxy, identity) = allocate(handle)?;
                let (winner, loser) = Self::install(&mut map, (tag, identity), proxy);
                drop(map);
                // Dropped outside the lock: its destructor may call remove()
                drop(loser);
                Ok(winner)
            }
            AllocPolicy::Optimistic => {
                {
                    let mut map = lock(&self.inner.map);
                    if let Some(existing) = Self::lookup(&mut map, &key) {
                        return Ok(existing);
                    }
                }
                let (proxy, identity) = allocate(handle)?;
                let mut map = lock(&self.inner.map);
                let (winner, loser) = Self::install(&mut map, (tag, identity), proxy);
                drop(map);
                drop(loser);
                Ok(winner)
            }
        }
    }

    /// Remove the entry for `(tag, identity)` only if its proxy is gone.
    ///
    /// Proxy expiry and this call are not atomic: by the time a dying proxy
    /// gets here another thread may have registered a fresh proxy for the
    /// same identity. A live entry is therefore always kept. Returns true if
    /// an entry was removed.
    pub fn remove(&self, tag: InterfaceTag, identity: &B::Identity) -> bool {
        let key = (tag, identity.clone());
        let mut map = lock(&self.inner.map);
        match map.get(&key) {
            Some(weak) if B::is_expired(weak) => {
                map.remove(&key);
                log::trace!("proxy cache: removed expired {}/{:?}", tag, identity);
                true
            }
            Some(_) => {
                log::debug!("proxy cache: kept live entry {}/{:?} on remove", tag, identity);
                false
            }
            None => false,
        }
    }

    /// Guard that calls [`remove`](Self::remove) when dropped. Embed it in
    /// the proxy so the entry is pruned as soon as the proxy is reclaimed.
    pub fn register(&self, tag: InterfaceTag, identity: B::Identity) -> ProxyRegistration<B> {
        ProxyRegistration {
            cache: self.clone(),
            tag,
            identity,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut map = lock(&self.inner.map);
        let before = map.len();
        map.retain(|_, weak| !B::is_expired(weak));
        let removed = before - map.len();
        if removed > 0 {
            log::debug!("proxy cache: pruned {} expired entries", removed);
        }
        removed
    }

    /// Whether a live proxy is registered for `(tag, identity)`.
    pub fn contains(&self, tag: InterfaceTag, identity: &B::Identity) -> bool {
        let map = lock(&self.inner.map);
        map.get(&(tag, identity.clone()))
            .map(|weak| !B::is_expired(weak))
            .unwrap_or(false)
    }

    /// Number of stored entries, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        lock(&self.inner.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Internals (called with the map locked)
    // -------------------------------------------------------------------------

    fn lookup(map: &mut HashMap<Key<B>, B::WeakProxy>, key: &Key<B>) -> Option<B::Proxy> {
        match map.get(key).map(|weak| B::upgrade(weak)) {
            Some(Some(proxy)) => Some(proxy),
            Some(None) => {
                map.remove(key);
                log::trace!("proxy cache: pruned expired {}/{:?} on lookup", key.0, key.1);
                None
            }
            None => None,
        }
    }

    /// Register `proxy` unless a live entry already exists. Returns the
    /// winner, plus the discarded proxy for the caller to drop after unlocking.
    fn install(
        map: &mut HashMap<Key<B>, B::WeakProxy>,
        key: Key<B>,
        proxy: B::Proxy,
    ) -> (B::Proxy, Option<B::Proxy>) {
        if let Some(existing) = Self::lookup(map, &key) {
            log::debug!("proxy cache: lost allocation race for {}/{:?}, discarding", key.0, key.1);
            return (existing, Some(proxy));
        }
        log::debug!("proxy cache: allocated proxy for {}/{:?}", key.0, key.1);
        map.insert(key, B::downgrade(&proxy));
        (proxy, None)
    }
}

impl<B> ProxyCache<B>
where
    B: Boundary<Proxy = ProxyRef>,
{
    /// Typed [`get`](Self::get): the allocator returns a concrete proxy and
    /// the cached proxy is downcast back to it.
    pub fn get_typed<P, H, E, F>(&self, tag: InterfaceTag, handle: &H, allocate: F) -> Result<Arc<P>, E>
    where
        P: Any + Send + Sync,
        H: Identify<B::Identity> + ?Sized,
        E: From<CacheError>,
        F: FnOnce(&H) -> Result<(Arc<P>, B::Identity), E>,
    {
        let proxy = self.get(tag, handle, |h| {
            allocate(h).map(|(proxy, identity)| (proxy as ProxyRef, identity))
        })?;
        proxy.downcast::<P>().map_err(|_| {
            E::from(CacheError::ProxyTypeMismatch {
                tag: tag.name(),
                expected: type_name::<P>(),
            })
        })
    }
}

// =============================================================================
// ProxyRegistration - eager pruning from the proxy's destructor
// =============================================================================

/// Held by a proxy; removes the proxy's cache entry when dropped.
pub struct ProxyRegistration<B: Boundary> {
    cache: ProxyCache<B>,
    tag: InterfaceTag,
    identity: B::Identity,
}

impl<B: Boundary> ProxyRegistration<B> {
    pub fn tag(&self) -> InterfaceTag {
        self.tag
    }

    pub fn identity(&self) -> &B::Identity {
        &self.identity
    }
}

impl<B: Boundary> Drop for ProxyRegistration<B> {
    fn drop(&mut self) {
        self.cache.remove(self.tag, &self.identity);
    }
}

impl<B: Boundary> fmt::Debug for ProxyRegistration<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRegistration")
            .field("tag", &self.tag)
            .field("identity", &self.identity)
            .finish()
    }
}

// =============================================================================
// Process-wide caches
// =============================================================================

static NATIVE_TO_HOST: OnceLock<ProxyCache<NativeToHost>> = OnceLock::new();
static HOST_TO_NATIVE: OnceLock<ProxyCache<HostToNative>> = OnceLock::new();

/// The cache for native objects crossing into the host.
pub fn native_to_host() -> &'static ProxyCache<NativeToHost> {
    NATIVE_TO_HOST.get_or_init(|| ProxyCache::with_config(CacheConfig::from_env()))
}

/// The cache for host objects crossing into native code.
pub fn host_to_native() -> &'static ProxyCache<HostToNative> {
    HOST_TO_NATIVE.get_or_init(|| ProxyCache::with_config(CacheConfig::from_env()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    /// Direction keyed by raw integers, for scenarios written in addresses.
    struct Raw;

    impl Boundary for Raw {
        type Identity = usize;
        type Proxy = ProxyRef;
        type WeakProxy = WeakProxyRef;

        fn downgrade(proxy: &ProxyRef) -> WeakProxyRef {
            Arc::downgrade(proxy)
        }
        fn upgrade(weak: &WeakProxyRef) -> Option<ProxyRef> {
            weak.upgrade()
        }
        fn is_expired(weak: &WeakProxyRef) -> bool {
            weak.strong_count() == 0
        }
    }

    impl Identify<usize> for usize {
        fn identity(&self) -> usize {
            *self
        }
    }

    const CALC: InterfaceTag = InterfaceTag::named("Calc");

    struct Proxy(usize);

    fn counting_alloc(count: &AtomicUsize) -> impl Fn(&usize) -> Result<(ProxyRef, usize), Infallible> + '_ {
        move |h: &usize| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok((Arc::new(Proxy(*h)) as ProxyRef, *h))
        }
    }

    #[test]
    fn second_get_returns_same_proxy_without_allocating() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = AtomicUsize::new(0);

        let p1 = cache.get(CALC, &0xABC_usize, counting_alloc(&allocs)).unwrap();
        let p2 = cache.get(CALC, &0xABC_usize, counting_alloc(&allocs)).unwrap();

        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_proxy_is_reallocated() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = AtomicUsize::new(0);

        let p1 = cache.get(CALC, &0xABC_usize, counting_alloc(&allocs)).unwrap();
        let weak = Arc::downgrade(&p1);
        drop(p1);
        assert!(weak.upgrade().is_none(), "cache must not keep the proxy alive");
        assert_eq!(cache.len(), 1, "entry lingers until pruned");
        assert!(!cache.contains(CALC, &0xABC_usize));

        let _p2 = cache.get(CALC, &0xABC_usize, counting_alloc(&allocs)).unwrap();
        assert_eq!(allocs.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn tags_partition_the_identity_space() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = AtomicUsize::new(0);
        let a = cache.get(CALC, &1_usize, counting_alloc(&allocs)).unwrap();
        let b = cache.get(InterfaceTag::named("Listener"), &1_usize, counting_alloc(&allocs)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_keeps_live_entries() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = AtomicUsize::new(0);

        let p = cache.get(CALC, &7_usize, counting_alloc(&allocs)).unwrap();
        assert!(!cache.remove(CALC, &7_usize));
        assert!(cache.contains(CALC, &7_usize));

        drop(p);
        assert!(cache.remove(CALC, &7_usize));
        assert!(cache.is_empty());
        assert!(!cache.remove(CALC, &7_usize));
    }

    #[test]
    fn registration_prunes_on_proxy_drop() {
        struct Registered {
            _registration: ProxyRegistration<Raw>,
        }

        let cache = ProxyCache::<Raw>::new();
        let c = cache.clone();
        let proxy = cache
            .get(CALC, &9_usize, move |h: &usize| {
                let proxy = Arc::new(Registered {
                    _registration: c.register(CALC, *h),
                });
                Ok::<_, Infallible>((proxy as ProxyRef, *h))
            })
            .unwrap();

        assert_eq!(cache.len(), 1);
        drop(proxy);
        assert!(cache.is_empty());
    }

    #[test]
    fn allocation_failure_propagates_unchanged() {
        #[derive(Debug, PartialEq)]
        struct OutOfHandles;

        let cache = ProxyCache::<Raw>::new();
        let err = cache
            .get(CALC, &3_usize, |_: &usize| Err::<(ProxyRef, usize), _>(OutOfHandles))
            .unwrap_err();
        assert_eq!(err, OutOfHandles);
        assert!(cache.is_empty());
    }

    #[test]
    fn typed_get_downcasts() {
        let cache = ProxyCache::<Raw>::new();
        let p: Arc<Proxy> = cache
            .get_typed(CALC, &5_usize, |h: &usize| Ok::<_, CacheError>((Arc::new(Proxy(*h)), *h)))
            .unwrap();
        assert_eq!(p.0, 5);

        let err = cache
            .get_typed::<String, _, CacheError, _>(CALC, &5_usize, |h: &usize| {
                Ok((Arc::new(String::new()), *h))
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::ProxyTypeMismatch { tag: "Calc", .. }));
        drop(p);
    }

    #[test]
    fn prune_removes_only_expired() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = AtomicUsize::new(0);
        let keep = cache.get(CALC, &1_usize, counting_alloc(&allocs)).unwrap();
        drop(cache.get(CALC, &2_usize, counting_alloc(&allocs)).unwrap());
        drop(cache.get(CALC, &3_usize, counting_alloc(&allocs)).unwrap());

        assert_eq!(cache.prune(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(CALC, &1_usize));
        drop(keep);
    }

    #[test]
    fn locked_policy_allocates_once_under_contention() {
        let cache = ProxyCache::<Raw>::new();
        let allocs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let allocs = allocs.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(CALC, &42_usize, counting_alloc(&allocs)).unwrap()
                })
            })
            .collect();

        let proxies: Vec<ProxyRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(allocs.load(Ordering::SeqCst), 1);
        assert!(proxies.iter().all(|p| Arc::ptr_eq(p, &proxies[0])));
    }

    #[test]
    fn optimistic_policy_converges_on_one_winner() {
        let cache = ProxyCache::<Raw>::with_config(CacheConfig::default().with_policy(AllocPolicy::Optimistic));
        let allocs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let allocs = allocs.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(CALC, &42_usize, counting_alloc(&allocs)).unwrap()
                })
            })
            .collect();

        let proxies: Vec<ProxyRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(allocs.load(Ordering::SeqCst) >= 1);
        assert!(proxies.iter().all(|p| Arc::ptr_eq(p, &proxies[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn optimistic_allocator_may_reenter_the_cache() {
        let cache = ProxyCache::<Raw>::with_config(CacheConfig::default().with_policy(AllocPolicy::Optimistic));
        let allocs = AtomicUsize::new(0);
        let inner = cache.clone();

        let outer = cache
            .get(CALC, &1_usize, |h: &usize| {
                // Crossing the object's dependency back through the same cache
                let dep = inner.get(InterfaceTag::named("Dep"), &100_usize, counting_alloc(&allocs))?;
                Ok::<_, Infallible>((Arc::new((Proxy(*h), dep)) as ProxyRef, *h))
            })
            .unwrap();

        assert!(cache.contains(CALC, &1_usize));
        assert!(cache.contains(InterfaceTag::named("Dep"), &100_usize));
        drop(outer);
    }

    #[test]
    fn globals_are_singletons() {
        assert!(std::ptr::eq(native_to_host(), native_to_host()));
        assert!(std::ptr::eq(host_to_native(), host_to_native()));
    }
}
