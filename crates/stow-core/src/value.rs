//! Value bounds and raw-form conversions
//!
//! Every persisted value travels through `serde_json::Value` ("raw form").
//! The raw form doubles as the deep copy used for default capture: a value
//! rebuilt from its own serialization shares no state with the original.

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Types that can live in a [`PersistedCell`](crate::PersistedCell)
///
/// Blanket-implemented for everything serde can round-trip.
pub trait PersistValue: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> PersistValue for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Serialize a value to raw form
///
/// # Errors
/// Returns [`CoreError::Serialize`] if the value's `Serialize` impl fails
/// (for example a map with non-string keys).
#[inline]
pub fn to_raw<T: Serialize>(value: &T) -> Result<Value, CoreError> {
    serde_json::to_value(value).map_err(CoreError::Serialize)
}

/// Deserialize a raw value as the declared type
///
/// # Errors
/// Returns [`CoreError::TypeMismatch`] if the raw value does not fit `T`.
#[inline]
pub fn from_raw<T: DeserializeOwned>(raw: Value) -> Result<T, CoreError> {
    serde_json::from_value(raw).map_err(|source| CoreError::TypeMismatch {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

/// Structurally independent copy of a value
///
/// # Errors
/// Fails if the value does not survive its own serialization.
pub fn deep_copy<T: PersistValue>(value: &T) -> Result<T, CoreError> {
    from_raw(to_raw(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn deep_copy_is_independent_of_original() {
        let mut original = BTreeMap::new();
        original.insert("bars".to_string(), vec![1, 2, 3]);
        let copy = deep_copy(&original).unwrap();

        original.get_mut("bars").unwrap().push(4);

        assert_eq!(copy["bars"], vec![1, 2, 3]);
        assert_ne!(copy, original);
    }

    #[test]
    fn from_raw_reports_declared_type() {
        let err = from_raw::<u32>(Value::String("nope".into())).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { type_name: "u32", .. }));
    }

    #[test]
    fn to_raw_rejects_non_string_map_keys() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1u8);
        assert!(matches!(to_raw(&map), Err(CoreError::Serialize(_))));
    }
}
