//! Request-scoped context threaded through the interceptor chain (spec §4.8
//! `middleware.h`: a shared context object so later layers can read what earlier
//! layers already decided, without re-deriving it).
//!
//! Grounded on the teacher's `X402Middleware`'s `Arc<F>` handle: cheap to clone,
//! shared rather than copied per layer.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A typed extension map, keyed by `TypeId` so each layer can stash (and later read)
/// strongly-typed state without the chain needing to know about every layer's types.
#[derive(Default, Clone)]
pub struct RequestContext {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_by_type() {
        let mut ctx = RequestContext::new();
        ctx.insert("sip:alice@home.net".to_string());
        ctx.insert(42u32);

        assert_eq!(*ctx.get::<String>().unwrap(), "sip:alice@home.net");
        assert_eq!(*ctx.get::<u32>().unwrap(), 42);
        assert!(ctx.get::<bool>().is_none());
    }
}
