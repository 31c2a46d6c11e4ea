//! Field/value model backing records and client copies.
//!
//! This is deliberately small: scalar and scalar-array leaves, nested
//! structures, and a flattened [`Layout`] whose offsets are shared by change
//! bitsets, projections and the record field tree.

mod structure;
mod value;

pub use structure::{FieldDesc, FieldKind, FieldType, Layout, PvStructure, Structure, StructureBuilder};
pub use value::{ScalarType, Value};
