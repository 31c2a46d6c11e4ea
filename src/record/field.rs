//! The record field tree.
//!
//! One [`FieldNode`] per offset of the record layout. Parents are plain
//! offsets into the same arena, so the tree has no reference cycles and its
//! shape is fixed once the record is built.

use std::sync::OnceLock;

use crate::data::Layout;

/// One addressable position (leaf or structure) in a record.
#[derive(Debug)]
pub struct FieldNode {
    offset: usize,
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    is_structure: bool,
    full_field_name: OnceLock<String>,
    full_name: OnceLock<String>,
}

impl FieldNode {
    /// Offset of this field in the record layout.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Field name; empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the parent structure; `None` only for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Offsets of the direct sub-fields.
    #[must_use]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// True for structure fields.
    #[must_use]
    pub const fn is_structure(&self) -> bool {
        self.is_structure
    }
}

/// Arena of [`FieldNode`]s mirroring a record layout one-to-one.
#[derive(Debug)]
pub struct FieldTree {
    record_name: String,
    nodes: Vec<FieldNode>,
}

impl FieldTree {
    pub(crate) fn new(record_name: &str, layout: &Layout) -> Self {
        let mut nodes: Vec<FieldNode> = layout
            .fields()
            .iter()
            .map(|desc| FieldNode {
                offset: desc.offset(),
                name: desc.name().to_string(),
                parent: desc.parent(),
                children: Vec::new(),
                is_structure: desc.is_structure(),
                full_field_name: OnceLock::new(),
                full_name: OnceLock::new(),
            })
            .collect();
        for offset in 1..nodes.len() {
            if let Some(parent) = nodes[offset].parent {
                nodes[parent].children.push(offset);
            }
        }
        Self {
            record_name: record_name.to_string(),
            nodes,
        }
    }

    /// The root structure node.
    #[must_use]
    pub fn root(&self) -> &FieldNode {
        &self.nodes[0]
    }

    /// Node at `offset`.
    #[must_use]
    pub fn node(&self, offset: usize) -> Option<&FieldNode> {
        self.nodes.get(offset)
    }

    /// Number of nodes, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a tree without nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parent node of `node`.
    #[must_use]
    pub fn parent_of(&self, node: &FieldNode) -> Option<&FieldNode> {
        node.parent.and_then(|p| self.nodes.get(p))
    }

    /// Dotted path below the root: `a.b`; empty for the root.
    #[must_use]
    pub fn full_field_name(&self, offset: usize) -> Option<&str> {
        let node = self.nodes.get(offset)?;
        Some(node.full_field_name.get_or_init(|| {
            let mut names = Vec::new();
            let mut current = Some(node);
            while let Some(n) = current {
                if n.parent.is_some() {
                    names.push(n.name.as_str());
                }
                current = self.parent_of(n);
            }
            names.reverse();
            names.join(".")
        }))
    }

    /// Record name plus the field path: `rec.a.b`; just `rec` for the root.
    #[must_use]
    pub fn full_name(&self, offset: usize) -> Option<&str> {
        let node = self.nodes.get(offset)?;
        let field_name = self.full_field_name(offset)?;
        Some(node.full_name.get_or_init(|| {
            if field_name.is_empty() {
                self.record_name.clone()
            } else {
                format!("{}.{field_name}", self.record_name)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ScalarType, Structure};

    fn tree() -> FieldTree {
        let layout = Layout::new(
            &Structure::builder()
                .add("a", ScalarType::Double)
                .add_nested("b")
                .add("c", ScalarType::Double)
                .end_nested()
                .build(),
        );
        FieldTree::new("rec", &layout)
    }

    #[test]
    fn shape_mirrors_layout() {
        let tree = tree();
        assert_eq!(tree.len(), 4);
        assert!(tree.root().parent().is_none());
        assert_eq!(tree.root().children(), &[1, 2]);
        assert_eq!(tree.node(2).unwrap().children(), &[3]);
        assert!(tree.node(2).unwrap().is_structure());
        assert!(!tree.node(3).unwrap().is_structure());
        assert_eq!(tree.parent_of(tree.node(3).unwrap()).unwrap().offset(), 2);
    }

    #[test]
    fn full_names_are_dotted_and_cached() {
        let tree = tree();
        assert_eq!(tree.full_name(0), Some("rec"));
        assert_eq!(tree.full_field_name(0), Some(""));
        assert_eq!(tree.full_name(3), Some("rec.b.c"));
        assert_eq!(tree.full_field_name(3), Some("b.c"));
        let first = tree.full_name(3).unwrap().as_ptr();
        assert_eq!(tree.full_name(3).unwrap().as_ptr(), first);
        assert_eq!(tree.full_name(99), None);
    }
}
