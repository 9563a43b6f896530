//! Per-request scratch values.
//!
//! A [`RequestProperties`] is created when a request arrives, travels through
//! the received, started and ended hooks, and is dropped when the request
//! finishes. Values are keyed by type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::Instant;

/// When the request was taken off the broker.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedAt(pub Instant);

/// Reply subject of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo(pub String);

/// Service subject the request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSubject(pub String);

/// Typed map owned by a single request.
#[derive(Default)]
pub struct RequestProperties {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl RequestProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for RequestProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProperties")
            .field("len", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_values() {
        let mut props = RequestProperties::new();
        assert!(props.is_empty());

        props.insert(ReplyTo("_INBOX.1".to_string()));
        props.insert(42u32);
        assert_eq!(props.len(), 2);
        assert_eq!(props.get::<ReplyTo>(), Some(&ReplyTo("_INBOX.1".to_string())));
        assert_eq!(props.get::<u32>(), Some(&42));
        assert!(props.get::<ServiceSubject>().is_none());

        let previous = props.insert(7u32);
        assert_eq!(previous, Some(42));

        if let Some(n) = props.get_mut::<u32>() {
            *n += 1;
        }
        assert_eq!(props.remove::<u32>(), Some(8));
        assert!(!props.contains::<u32>());
    }
}
