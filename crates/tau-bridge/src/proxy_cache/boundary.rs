//! Boundary directions, identities and interface tags.
//!
//! A [`Boundary`] fixes, for one crossing direction, what identifies the
//! wrapped object and how proxies are observed without being owned. The
//! cache code is instantiated once per direction, never per interface.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Owning reference to a proxy object of any interface.
pub type ProxyRef = Arc<dyn Any + Send + Sync>;

/// Non-owning observation of a [`ProxyRef`].
pub type WeakProxyRef = Weak<dyn Any + Send + Sync>;

/// Owning reference to a native implementation object.
pub type NativeHandle = Arc<dyn Any + Send + Sync>;

// =============================================================================
// Boundary - per-direction cache traits
// =============================================================================

/// One direction of the language boundary.
pub trait Boundary: 'static {
    /// Non-owning identity of the wrapped object. Compared by value.
    type Identity: Eq + Hash + Clone + Send + fmt::Debug + 'static;
    /// Owning reference to a proxy.
    type Proxy: Clone;
    /// Non-owning reference to a proxy. The cache stores only these.
    type WeakProxy: Send;

    fn downgrade(proxy: &Self::Proxy) -> Self::WeakProxy;
    fn upgrade(weak: &Self::WeakProxy) -> Option<Self::Proxy>;
    fn is_expired(weak: &Self::WeakProxy) -> bool;
}

/// Native objects crossing into the host. Identity is the object's address.
#[derive(Debug, Clone, Copy)]
pub struct NativeToHost;

impl Boundary for NativeToHost {
    type Identity = ObjectId;
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

/// Host objects crossing into native code. Identity is the host's reference
/// value, a generation-tagged slot in the host's reference table.
#[derive(Debug, Clone, Copy)]
pub struct HostToNative;

impl Boundary for HostToNative {
    type Identity = ForeignRef;
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

// =============================================================================
// Identities
// =============================================================================

/// Address identity of a shared native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Identity of the object behind `handle`. Clones of one `Arc` share it.
    pub fn of<T: ?Sized>(handle: &Arc<T>) -> Self {
        ObjectId(Arc::as_ptr(handle) as *const () as usize)
    }

    pub const fn from_raw(addr: usize) -> Self {
        ObjectId(addr)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// A value-typed reference into a host's object table.
///
/// Packs `(generation, slot)` the way task ids are packed for FFI: a slot can
/// be reused, but never with the same generation, so a stale reference never
/// aliases a newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignRef {
    slot: u32,
    generation: u32,
}

impl ForeignRef {
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub const fn slot(self) -> u32 {
        self.slot
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub const fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    pub const fn unpack(packed: u64) -> Self {
        Self {
            slot: packed as u32,
            generation: (packed >> 32) as u32,
        }
    }
}

/// Derive the cache identity of a handle.
pub trait Identify<I> {
    fn identity(&self) -> I;
}

impl<T: ?Sized> Identify<ObjectId> for Arc<T> {
    fn identity(&self) -> ObjectId {
        ObjectId::of(self)
    }
}

impl Identify<ForeignRef> for ForeignRef {
    fn identity(&self) -> ForeignRef {
        *self
    }
}

// =============================================================================
// ForeignRefTable - generation-counted slots for host objects
// =============================================================================

struct RefSlot<T> {
    value: Option<T>,
    generation: u32,
}

/// Slot table handing out [`ForeignRef`]s, as a host runtime's global
/// reference table does. Releasing a slot bumps its generation.
pub struct ForeignRefTable<T> {
    slots: Vec<RefSlot<T>>,
    free: Vec<u32>,
}

impl<T> Default for ForeignRefTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ForeignRefTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> ForeignRef {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return ForeignRef::new(slot, entry.generation);
        }
        let slot = self.slots.len() as u32;
        self.slots.push(RefSlot {
            value: Some(value),
            generation: 0,
        });
        ForeignRef::new(slot, 0)
    }

    pub fn get(&self, r: ForeignRef) -> Option<&T> {
        let entry = self.slots.get(r.slot as usize)?;
        if entry.generation != r.generation {
            return None;
        }
        entry.value.as_ref()
    }

    /// Release a reference. Stale references return `None`.
    pub fn release(&mut self, r: ForeignRef) -> Option<T> {
        let entry = self.slots.get_mut(r.slot as usize)?;
        if entry.generation != r.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(r.slot);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// InterfaceTag
// =============================================================================

/// Process-unique identifier of an interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceTag {
    name: &'static str,
    type_id: Option<TypeId>,
}

impl InterfaceTag {
    /// Tag derived from a Rust type.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            type_id: Some(TypeId::of::<T>()),
        }
    }

    /// Tag derived from a declared interface name.
    pub const fn named(name: &'static str) -> Self {
        Self {
            name,
            type_id: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for InterfaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_follows_the_allocation() {
        let a: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        let b = a.clone();
        let c: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn foreign_ref_pack_unpack() {
        let r = ForeignRef::new(7, 3);
        assert_eq!(ForeignRef::unpack(r.pack()), r);
        assert_eq!(r.pack(), (3u64 << 32) | 7);
    }

    #[test]
    fn ref_table_generations() {
        let mut table = ForeignRefTable::new();
        let a = table.insert("a");
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.release(a), Some("a"));
        assert_eq!(table.get(a), None);

        let b = table.insert("b");
        assert_eq!(b.slot(), a.slot());
        assert_ne!(b, a);
        assert_eq!(table.release(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn tags() {
        assert_eq!(InterfaceTag::named("Calc"), InterfaceTag::named("Calc"));
        assert_ne!(InterfaceTag::named("Calc"), InterfaceTag::named("Listener"));
        assert_eq!(InterfaceTag::of::<u32>(), InterfaceTag::of::<u32>());
        assert_ne!(InterfaceTag::of::<u32>(), InterfaceTag::of::<u64>());
        assert_eq!(InterfaceTag::named("Calc").to_string(), "Calc");
    }
}
