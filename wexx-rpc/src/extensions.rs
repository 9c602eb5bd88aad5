use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Per-request values keyed by their type.
///
/// Middleware earlier in the dispatch pipeline put things here (shared application state, the
/// authenticated caller, timings) for handlers later in the chain to pick up, without this crate
/// defining _a priori_ what those are.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync + 'static>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type if there was one
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Caller(String);

    #[test]
    fn values_are_keyed_by_type() {
        let mut extensions = Extensions::new();
        assert!(extensions.is_empty());

        assert_eq!(extensions.insert(Caller("alice".into())), None);
        assert_eq!(extensions.insert(42u32), None);
        assert_eq!(extensions.len(), 2);

        assert_eq!(extensions.get::<Caller>(), Some(&Caller("alice".into())));
        assert_eq!(extensions.get::<u32>(), Some(&42));
        assert_eq!(extensions.get::<u64>(), None);

        *extensions.get_mut::<u32>().unwrap() += 1;
        assert_eq!(extensions.insert(0u32), Some(43));

        assert_eq!(extensions.remove::<Caller>(), Some(Caller("alice".into())));
        assert!(!extensions.contains::<Caller>());
    }
}
