//! Persisted cells
//!
//! A [`PersistedCell`] is a cheaply cloneable handle to one typed value.
//! Mutations made through [`PersistedCell::set`] / [`PersistedCell::update`]
//! notify the attached [`TouchListener`]; restores performed by the load path
//! do not.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::CoreError;
use crate::value::{from_raw, to_raw, PersistValue};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique cell identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id
    #[inline]
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiver of change notifications
pub trait TouchListener: Send + Sync {
    /// A cell's value changed
    fn touched(&self, cell: CellId);
}

/// Type-erased view of a cell, used by the registry and the load/save path
pub trait ErasedCell: Send + Sync + fmt::Debug {
    /// Cell identity
    fn id(&self) -> CellId;

    /// Whether null is a legal value
    fn allows_null(&self) -> bool;

    /// Declared value type
    fn type_name(&self) -> &'static str;

    /// Current value in raw form
    ///
    /// # Errors
    /// Fails if the value cannot be serialized.
    fn to_raw(&self) -> Result<Value, CoreError>;

    /// Deserialize `raw` as the declared type and assign it without notifying
    ///
    /// On error the current value is left untouched.
    ///
    /// # Errors
    /// [`CoreError::TypeMismatch`] or [`CoreError::UnexpectedNull`].
    fn restore_raw(&self, raw: Value) -> Result<(), CoreError>;

    /// Attach the change listener, replacing any previous one
    fn attach(&self, listener: Weak<dyn TouchListener>);

    /// Notify the listener without changing the value
    fn notify(&self);
}

struct CellInner<T> {
    id: CellId,
    allows_null: bool,
    value: RwLock<T>,
    listener: RwLock<Option<Weak<dyn TouchListener>>>,
}

impl<T: PersistValue> CellInner<T> {
    fn notify_listener(&self) {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.touched(self.id);
        }
    }
}

impl<T: PersistValue> fmt::Debug for CellInner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedCell")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .field("value", &*self.value.read())
            .finish()
    }
}

impl<T: PersistValue> ErasedCell for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn allows_null(&self) -> bool {
        self.allows_null
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_raw(&self) -> Result<Value, CoreError> {
        to_raw(&*self.value.read())
    }

    fn restore_raw(&self, raw: Value) -> Result<(), CoreError> {
        if raw.is_null() && !self.allows_null {
            return Err(CoreError::UnexpectedNull(std::any::type_name::<T>()));
        }
        let value: T = from_raw(raw)?;
        *self.value.write() = value;
        Ok(())
    }

    fn attach(&self, listener: Weak<dyn TouchListener>) {
        *self.listener.write() = Some(listener);
    }

    fn notify(&self) {
        self.notify_listener();
    }
}

/// A single persisted value with change notification
pub struct PersistedCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for PersistedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PersistValue> fmt::Debug for PersistedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T: PersistValue> PersistedCell<T> {
    /// Create cell holding its compile-time initial value
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self::build(initial, false)
    }

    fn build(initial: T, allows_null: bool) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                allows_null,
                value: RwLock::new(initial),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Cell identity
    #[inline]
    #[must_use]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Whether null is a legal value
    #[inline]
    #[must_use]
    pub fn allows_null(&self) -> bool {
        self.inner.allows_null
    }

    /// Clone of the current value
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replace the value and notify the listener
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.inner.notify_listener();
    }

    /// Mutate in place and notify the listener
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.write());
        self.inner.notify_listener();
    }

    /// Type-erased handle sharing this cell's state
    #[must_use]
    pub fn erased(&self) -> Arc<dyn ErasedCell> {
        self.inner.clone()
    }
}

impl<T: PersistValue> PersistedCell<Option<T>> {
    /// Create a cell whose value (and default) may be `None`
    #[must_use]
    pub fn nullable(initial: Option<T>) -> Self {
        Self::build(initial, true)
    }
}
