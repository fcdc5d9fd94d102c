use std::any::{self, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a key's dynamic type.
///
/// Equality and hashing use the [`TypeId`] alone; the type name rides along
/// purely for diagnostics, since two distinct types can in principle share a
/// name string.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyKind {
    id: TypeId,
    name: &'static str,
}

impl KeyKind {
    pub(crate) fn of<K: 'static>() -> Self {
        Self {
            id: TypeId::of::<K>(),
            name: any::type_name::<K>(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for KeyKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyKind {}

impl Hash for KeyKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Object-safe shim over `Eq + Hash` keys of arbitrary concrete type.
pub(crate) trait AnyKey: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn eq_key(&self, other: &dyn AnyKey) -> bool;
    fn hash_key(&self, state: &mut dyn Hasher);
    fn kind(&self) -> KeyKind;
}

impl<K> AnyKey for K
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_key(&self, other: &dyn AnyKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn hash_key(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }

    fn kind(&self) -> KeyKind {
        KeyKind::of::<K>()
    }
}

/// A type-erased execution key.
///
/// Keys of different concrete types are never equal, even when their values
/// are, and the dynamic type participates in the hash, so packages sharing a
/// cache cannot collide as long as each defines its own key type.
#[derive(Clone, Debug)]
pub struct ExecutionKey(Arc<dyn AnyKey>);

impl ExecutionKey {
    /// Erases a concrete key.
    pub fn new<K>(key: K) -> Self
    where
        K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(key))
    }

    /// Borrows the concrete key back, if `K` is its dynamic type.
    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref()
    }

    /// The name of the key's dynamic type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.0.kind().name
    }

    pub(crate) fn kind(&self) -> KeyKind {
        self.0.kind()
    }
}

impl PartialEq for ExecutionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_key(other.0.as_ref())
    }
}

impl Eq for ExecutionKey {}

impl Hash for ExecutionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.kind().hash(state);
        self.0.hash_key(state);
    }
}
