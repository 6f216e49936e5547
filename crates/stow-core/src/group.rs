//! Dynamic groups
//!
//! A dynamic group owns a variable number of sibling owners. The engine asks
//! the group to (re)create a given id list before any member cell can be
//! registered, and reads the current ids back on every save.

use std::sync::Arc;

use crate::error::CoreError;
use crate::owner::Owner;

/// Capability implemented by collections of like-configured owners
pub trait DynamicGroup: Send + Sync {
    /// Key under which the id list is recorded in the stored document
    fn group_key(&self) -> String;

    /// Prefix prepended to every member's storage key
    fn member_prefix(&self) -> String;

    /// Ids created when the document records nothing for this group
    fn default_ids(&self) -> Vec<u32>;

    /// Recreate exactly `ids`, in order, dropping any other instance
    ///
    /// # Errors
    /// Returns [`CoreError::GroupMaterialize`] if the instances cannot be
    /// built.
    fn materialize(&self, ids: &[u32]) -> Result<(), CoreError>;

    /// Current member owners, in id order
    fn members(&self) -> Vec<Arc<dyn Owner>>;

    /// Current instance ids, in order
    fn instance_ids(&self) -> Vec<u32>;

    /// Mark current members enabled
    fn enable_members(&self) {}
}
