//! Structure descriptors, flattened layouts and value containers.
//!
//! A [`Structure`] is the nested type description a record or a client copy is
//! built from. [`Layout`] flattens it into pre-order: every field gets an
//! offset, offset 0 is the whole structure, and a structure's sub-fields occupy
//! the contiguous range `offset + 1 .. next_offset`. Offsets are what change
//! bitsets index and what projections translate between.

use std::sync::Arc;

use crate::error::{DatabaseError, DbResult};

use super::value::{ScalarType, Value};

/// Type of one member of a [`Structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Single scalar value.
    Scalar(ScalarType),
    /// Variable-length array of scalars.
    ScalarArray(ScalarType),
    /// Nested structure.
    Structure(Structure),
}

/// Ordered, named members of a structure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Structure {
    fields: Vec<(String, FieldType)>,
}

impl Structure {
    /// Start building a structure.
    #[must_use]
    pub fn builder() -> StructureBuilder {
        StructureBuilder::default()
    }

    /// The standard `timeStamp` sub-structure.
    #[must_use]
    pub fn time_stamp() -> Self {
        Self::builder()
            .add("secondsPastEpoch", ScalarType::Long)
            .add("nanoseconds", ScalarType::Int)
            .add("userTag", ScalarType::Int)
            .build()
    }

    /// Members in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of direct members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true when the structure has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fluent builder for [`Structure`].
///
/// ```
/// use pvdb::data::{ScalarType, Structure};
///
/// let s = Structure::builder()
///     .add("a", ScalarType::Double)
///     .add_nested("limits")
///     .add("low", ScalarType::Double)
///     .add("high", ScalarType::Double)
///     .end_nested()
///     .add_structure("timeStamp", Structure::time_stamp())
///     .build();
/// assert_eq!(s.len(), 3);
/// ```
#[derive(Debug, Default)]
pub struct StructureBuilder {
    fields: Vec<(String, FieldType)>,
    nested: Vec<(String, Vec<(String, FieldType)>)>,
}

impl StructureBuilder {
    fn push(mut self, name: &str, field: FieldType) -> Self {
        match self.nested.last_mut() {
            Some((_, fields)) => fields.push((name.to_string(), field)),
            None => self.fields.push((name.to_string(), field)),
        }
        self
    }

    /// Add a scalar member.
    #[must_use]
    pub fn add(self, name: &str, scalar: ScalarType) -> Self {
        self.push(name, FieldType::Scalar(scalar))
    }

    /// Add a scalar-array member.
    #[must_use]
    pub fn add_array(self, name: &str, scalar: ScalarType) -> Self {
        self.push(name, FieldType::ScalarArray(scalar))
    }

    /// Add an already-built structure member.
    #[must_use]
    pub fn add_structure(self, name: &str, structure: Structure) -> Self {
        self.push(name, FieldType::Structure(structure))
    }

    /// Open a nested structure; members added until `end_nested` go inside it.
    #[must_use]
    pub fn add_nested(mut self, name: &str) -> Self {
        self.nested.push((name.to_string(), Vec::new()));
        self
    }

    /// Close the innermost nested structure. Without an open one this is a no-op.
    #[must_use]
    pub fn end_nested(mut self) -> Self {
        match self.nested.pop() {
            Some((name, fields)) => self.push(&name, FieldType::Structure(Structure { fields })),
            None => self,
        }
    }

    /// Finish the structure, closing any nested structures left open.
    #[must_use]
    pub fn build(mut self) -> Structure {
        while !self.nested.is_empty() {
            self = self.end_nested();
        }
        Structure {
            fields: self.fields,
        }
    }
}

/// Kind of a flattened field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Single scalar.
    Scalar(ScalarType),
    /// Scalar array.
    ScalarArray(ScalarType),
    /// Structure; its sub-fields follow it in the layout.
    Structure,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Scalar(st) => !value.is_array() && value.scalar_type() == Some(st),
            Self::ScalarArray(st) => value.is_array() && value.scalar_type() == Some(st),
            Self::Structure => false,
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Scalar(st) => st.name().to_string(),
            Self::ScalarArray(st) => format!("{}[]", st.name()),
            Self::Structure => "structure".to_string(),
        }
    }
}

/// One entry of a [`Layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    name: String,
    parent: Option<usize>,
    offset: usize,
    next_offset: usize,
    kind: FieldKind,
}

impl FieldDesc {
    /// Field name; empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the enclosing structure; `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Offset of this field in its layout.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// One past the last offset of this field's sub-tree.
    #[must_use]
    pub const fn next_offset(&self) -> usize {
        self.next_offset
    }

    /// Scalar, array or structure.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    /// True for structure fields.
    #[must_use]
    pub const fn is_structure(&self) -> bool {
        matches!(self.kind, FieldKind::Structure)
    }
}

/// Pre-order flattening of a [`Structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<FieldDesc>,
}

impl Layout {
    /// Flatten a structure. The root is offset 0.
    #[must_use]
    pub fn new(structure: &Structure) -> Self {
        let mut fields = Vec::new();
        flatten_structure(&mut fields, String::new(), None, structure);
        Self { fields }
    }

    /// Number of offsets (the root included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always false: a layout has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Descriptor at `offset`.
    #[must_use]
    pub fn field(&self, offset: usize) -> Option<&FieldDesc> {
        self.fields.get(offset)
    }

    /// All descriptors, indexed by offset.
    #[must_use]
    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// Offsets of the direct sub-fields of `offset`.
    pub fn children(&self, offset: usize) -> impl Iterator<Item = usize> + '_ {
        let end = self.fields.get(offset).map_or(offset, FieldDesc::next_offset);
        let mut next = offset + 1;
        std::iter::from_fn(move || {
            if next >= end {
                return None;
            }
            let current = next;
            next = self.fields[current].next_offset;
            Some(current)
        })
    }

    /// Resolve a dotted path (`"a.b"`); the empty path is the root.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<usize> {
        let path = path.trim();
        if path.is_empty() {
            return Some(0);
        }
        let mut current = 0;
        for segment in path.split('.') {
            current = self
                .children(current)
                .find(|&c| self.fields[c].name == segment)?;
        }
        Some(current)
    }

    /// Dotted path of `offset`, without the root; empty for the root.
    #[must_use]
    pub fn path_of(&self, offset: usize) -> String {
        let mut names = Vec::new();
        let mut current = Some(offset);
        while let Some(off) = current {
            let Some(desc) = self.fields.get(off) else {
                break;
            };
            if desc.parent.is_some() {
                names.push(desc.name.as_str());
            }
            current = desc.parent;
        }
        names.reverse();
        names.join(".")
    }

    /// Rebuild the type description of the sub-tree at `offset`.
    #[must_use]
    pub fn field_type(&self, offset: usize) -> Option<FieldType> {
        let desc = self.fields.get(offset)?;
        Some(match desc.kind {
            FieldKind::Scalar(st) => FieldType::Scalar(st),
            FieldKind::ScalarArray(st) => FieldType::ScalarArray(st),
            FieldKind::Structure => FieldType::Structure(Structure {
                fields: self
                    .children(offset)
                    .filter_map(|c| Some((self.fields[c].name.clone(), self.field_type(c)?)))
                    .collect(),
            }),
        })
    }
}

fn flatten_structure(
    out: &mut Vec<FieldDesc>,
    name: String,
    parent: Option<usize>,
    structure: &Structure,
) -> usize {
    let offset = out.len();
    out.push(FieldDesc {
        name,
        parent,
        offset,
        next_offset: offset + 1,
        kind: FieldKind::Structure,
    });
    for (child_name, field) in &structure.fields {
        let child = out.len();
        match field {
            FieldType::Structure(s) => {
                flatten_structure(out, child_name.clone(), Some(offset), s);
            }
            FieldType::Scalar(st) | FieldType::ScalarArray(st) => {
                let kind = if matches!(field, FieldType::Scalar(_)) {
                    FieldKind::Scalar(*st)
                } else {
                    FieldKind::ScalarArray(*st)
                };
                out.push(FieldDesc {
                    name: child_name.clone(),
                    parent: Some(offset),
                    offset: child,
                    next_offset: child + 1,
                    kind,
                });
            }
        }
    }
    let next = out.len();
    out[offset].next_offset = next;
    next
}

/// A structure instance: a shared layout plus one value slot per offset.
#[derive(Debug, Clone, PartialEq)]
pub struct PvStructure {
    layout: Arc<Layout>,
    values: Vec<Value>,
}

impl PvStructure {
    /// Create an instance with every field at its default value.
    #[must_use]
    pub fn new(layout: Arc<Layout>) -> Self {
        let values = layout
            .fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Scalar(st) => st.default_value(),
                FieldKind::ScalarArray(st) => st.default_array(),
                FieldKind::Structure => Value::Null,
            })
            .collect();
        Self { layout, values }
    }

    /// Shorthand for `PvStructure::new(Arc::new(Layout::new(structure)))`.
    #[must_use]
    pub fn from_structure(structure: &Structure) -> Self {
        Self::new(Arc::new(Layout::new(structure)))
    }

    /// Layout shared by every instance of this structure.
    #[must_use]
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    /// Value at `offset`; `Null` for structures.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<&Value> {
        self.values.get(offset)
    }

    /// Value at a dotted path.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        self.layout.find(path).and_then(|o| self.values.get(o))
    }

    /// Store a value, checking it against the field's type.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` for an offset outside the layout, `TypeMismatch` when the
    /// value does not fit the field (structures never accept a value).
    pub fn put(&mut self, offset: usize, value: Value) -> DbResult<()> {
        let Some(desc) = self.layout.fields.get(offset) else {
            return Err(DatabaseError::FieldNotFound {
                path: format!("#{offset}"),
            });
        };
        if !desc.kind.accepts(&value) {
            return Err(DatabaseError::TypeMismatch {
                path: self.layout.path_of(offset),
                expected: desc.kind.describe(),
                actual: value.type_name().to_string(),
            });
        }
        self.values[offset] = value;
        Ok(())
    }

    /// Store a value at a dotted path, returning its offset.
    ///
    /// # Errors
    ///
    /// See [`PvStructure::put`].
    pub fn put_path(&mut self, path: &str, value: Value) -> DbResult<usize> {
        let offset = self.offset_of(path)?;
        self.put(offset, value)?;
        Ok(offset)
    }

    /// Offset of a dotted path.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` if the path does not exist.
    pub fn offset_of(&self, path: &str) -> DbResult<usize> {
        self.layout.find(path).ok_or_else(|| DatabaseError::FieldNotFound {
            path: path.to_string(),
        })
    }

    /// Read a double field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn double(&self, path: &str) -> DbResult<f64> {
        let value = &self.values[self.offset_of(path)?];
        value.as_double().ok_or_else(|| mismatch(path, "double", value))
    }

    /// Read an int field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn int(&self, path: &str) -> DbResult<i32> {
        let value = &self.values[self.offset_of(path)?];
        value.as_int().ok_or_else(|| mismatch(path, "int", value))
    }

    /// Read a string field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn string(&self, path: &str) -> DbResult<&str> {
        let value = &self.values[self.offset_of(path)?];
        value.as_str().ok_or_else(|| mismatch(path, "string", value))
    }

    /// Copy the sub-tree at `src_offset` of `src` onto the sub-tree at `offset`.
    ///
    /// Both sub-trees must have the same shape; the caller guarantees it.
    pub(crate) fn copy_subtree_from(&mut self, offset: usize, src: &Self, src_offset: usize) {
        let len = self.layout.fields[offset].next_offset - offset;
        self.values[offset..offset + len]
            .clone_from_slice(&src.values[src_offset..src_offset + len]);
    }

    /// Render as a JSON object (structures become objects).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.json_at(0)
    }

    fn json_at(&self, offset: usize) -> serde_json::Value {
        if self.layout.fields[offset].is_structure() {
            let map = self
                .layout
                .children(offset)
                .map(|c| (self.layout.fields[c].name.clone(), self.json_at(c)))
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(map)
        } else {
            self.values[offset].to_json()
        }
    }
}

fn mismatch(path: &str, expected: &str, actual: &Value) -> DatabaseError {
    DatabaseError::TypeMismatch {
        path: path.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}
