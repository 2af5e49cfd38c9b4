//! Type-erased shared values.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SerializerError};

/// An `Arc<dyn Any>` that remembers the Rust type name of what it holds.
#[derive(Clone)]
pub struct ErasedArc {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl fmt::Debug for ErasedArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErasedArc<{}>", self.type_name)
    }
}

impl ErasedArc {
    pub fn new<T: 'static + Send + Sync>(arc: Arc<T>) -> Self {
        ErasedArc {
            inner: arc,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn from_value<T: 'static + Send + Sync>(value: T) -> Self {
        Self::new(Arc::new(value))
    }

    /// Rust type name of the contained value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Identity comparison of the underlying allocation.
    pub fn ptr_eq(&self, other: &ErasedArc) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Extract the shared `Arc<T>`.
    pub fn as_arc<T: 'static + Send + Sync>(&self) -> Result<Arc<T>> {
        self.inner
            .clone()
            .downcast::<T>()
            .map_err(|_| SerializerError::type_mismatch(std::any::type_name::<T>(), self.type_name))
    }
}
