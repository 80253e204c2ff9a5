//! Type-erased per-request extensions.
//!
//! Transport-specific settings (timeouts, connection agents and the like) travel
//! here rather than in typed request fields. Nothing stored in an [`Extensions`]
//! map contributes to a cache key, so values need not be serialisable.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Type-erased map keyed by value type.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fetch_cache::http::Extensions;
/// use fetch_cache::transport::RequestTimeout;
///
/// let mut ext = Extensions::new();
/// ext.insert(RequestTimeout(Duration::from_secs(2)));
/// assert_eq!(ext.get::<RequestTimeout>().map(|t| t.0), Some(Duration::from_secs(2)));
/// ```
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Moves every value of `other` into `self`; values in `other` win.
    pub fn extend(&mut self, other: Extensions) {
        self.map.extend(other.map);
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Agent(&'static str);

    #[test]
    fn extend_overrides_existing_values() {
        let mut base = Extensions::new();
        base.insert(Agent("base"));
        base.insert(7u32);

        let mut over = Extensions::new();
        over.insert(Agent("override"));
        base.extend(over);

        assert_eq!(base.get::<Agent>(), Some(&Agent("override")));
        assert_eq!(base.get::<u32>(), Some(&7));
        assert_eq!(base.remove::<u32>(), Some(7));
        assert!(base.get::<u32>().is_none());
    }
}
