//! Callbacks attached to records.
//!
//! Every callback runs synchronously on the thread that holds the record
//! lock, with that lock held. Callbacks must not block for long and must not
//! lock another record except through
//! [`RecordGuard::lock_other_record`](super::RecordGuard::lock_other_record).

use super::field::FieldNode;
use super::{Record, RecordGuard};

/// Receives field changes and group-put brackets for one record.
pub trait RecordListener: Send + Sync {
    /// `field` was written; the listener is registered on `field` itself
    /// (or on a structure that contains it and was replaced wholesale).
    fn data_put(&self, record: &RecordGuard<'_>, field: &FieldNode);

    /// `field` was written; the listener is registered on its ancestor
    /// structure `requested`.
    fn data_put_sub(&self, record: &RecordGuard<'_>, requested: &FieldNode, field: &FieldNode);

    /// Outermost `begin_group_put`.
    fn begin_group_put(&self, _record: &RecordGuard<'_>) {}

    /// Outermost `end_group_put`.
    fn end_group_put(&self, _record: &RecordGuard<'_>) {}

    /// The record is going away; the listener will receive nothing further.
    fn unlisten(&self, _record: &RecordGuard<'_>) {}
}

/// Anything attached to a record that must be told when the record is destroyed.
pub trait RecordClient: Send + Sync {
    /// The record detached this client (it is being destroyed).
    fn detach(&self, record: &Record);
}

/// Identity comparison for trait objects (data pointer only).
pub(crate) fn same_object<T: ?Sized, U: ?Sized>(a: &T, b: &U) -> bool {
    std::ptr::eq((a as *const T).cast::<()>(), (b as *const U).cast::<()>())
}
