//! Projection of a record's fields onto a client-facing copy.
//!
//! A [`Projection`] maps the sub-trees selected by a request ("master" fields
//! in the record) onto a smaller copy layout. Offsets inside a selected
//! sub-tree translate by a constant shift, which is what lets monitors and
//! channel handlers move data with bitsets instead of paths.

mod request;

pub use request::PvRequest;

use std::sync::Arc;

use crate::bitset::BitSet;
use crate::data::{FieldType, Layout, PvStructure, Structure};
use crate::error::{DatabaseError, DbResult};

/// Mapping between a record layout and a client copy layout.
#[derive(Debug, Clone)]
pub struct Projection {
    master: Arc<Layout>,
    copy: Arc<Layout>,
    request: PvRequest,
    /// `(master offset, copy offset)` of each selected sub-tree root, in
    /// ascending offset order on both sides.
    selected: Vec<(usize, usize)>,
}

impl Projection {
    /// Build the projection of `request` over `master`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if a requested path does not exist in `master`.
    pub fn create(master: &Arc<Layout>, request: &PvRequest) -> DbResult<Self> {
        if request.selects_all() {
            return Ok(Self {
                master: Arc::clone(master),
                copy: Arc::clone(master),
                request: request.clone(),
                selected: vec![(0, 0)],
            });
        }

        let mut roots = Vec::with_capacity(request.fields().len());
        for path in request.fields() {
            let offset = master.find(path).ok_or_else(|| {
                DatabaseError::invalid_request(format!("field '{path}' does not exist"))
            })?;
            roots.push(offset);
        }
        roots.sort_unstable();
        roots.dedup();
        // A selection nested inside another selection is already covered.
        let mut kept: Vec<usize> = Vec::with_capacity(roots.len());
        for offset in roots {
            let covered = kept
                .last()
                .is_some_and(|&r| offset < master.fields()[r].next_offset());
            if !covered {
                kept.push(offset);
            }
        }
        if kept.first() == Some(&0) {
            return Self::create(master, &PvRequest::whole()).map(|mut p| {
                p.request = request.clone();
                p
            });
        }

        let structure = match select_type(master, 0, &kept) {
            Some(FieldType::Structure(s)) => s,
            _ => Structure::default(),
        };
        let copy = Arc::new(Layout::new(&structure));
        let mut selected = Vec::with_capacity(kept.len());
        for m in kept {
            let c = copy.find(&master.path_of(m)).ok_or_else(|| {
                DatabaseError::internal(format!("projection lost field at offset {m}"))
            })?;
            selected.push((m, c));
        }

        Ok(Self {
            master: Arc::clone(master),
            copy,
            request: request.clone(),
            selected,
        })
    }

    /// Parse `request` and build the projection.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for malformed text or unknown fields.
    pub fn from_request(master: &Arc<Layout>, request: &str) -> DbResult<Self> {
        Self::create(master, &PvRequest::parse(request)?)
    }

    /// Layout of the record side.
    #[must_use]
    pub fn master_layout(&self) -> &Arc<Layout> {
        &self.master
    }

    /// Layout of the client copies.
    #[must_use]
    pub fn copy_layout(&self) -> &Arc<Layout> {
        &self.copy
    }

    /// The parsed request this projection was built from.
    #[must_use]
    pub fn request(&self) -> &PvRequest {
        &self.request
    }

    /// Visit the master offset of every selected sub-tree root.
    pub fn traverse_selected(&self, mut f: impl FnMut(usize)) {
        for &(m, _) in &self.selected {
            f(m);
        }
    }

    /// Copy offset of a master field, if the field lies in a selected sub-tree.
    #[must_use]
    pub fn offset_of(&self, master_offset: usize) -> Option<usize> {
        self.selected.iter().find_map(|&(m, c)| {
            let end = self.master.fields()[m].next_offset();
            (m..end).contains(&master_offset).then(|| c + (master_offset - m))
        })
    }

    /// Master offset of a copy field, if the field lies in a selected sub-tree.
    #[must_use]
    pub fn master_offset_of(&self, copy_offset: usize) -> Option<usize> {
        self.selected.iter().find_map(|&(m, c)| {
            let end = self.copy.fields()[c].next_offset();
            (c..end).contains(&copy_offset).then(|| m + (copy_offset - c))
        })
    }

    /// A fresh copy instance with default values.
    #[must_use]
    pub fn new_buffer(&self) -> PvStructure {
        PvStructure::new(Arc::clone(&self.copy))
    }

    /// Copy every field named by `bits` (copy offsets) from `master` into
    /// `buffer`. A structure bit copies its whole selected content.
    pub fn copy_from_master(&self, master: &PvStructure, buffer: &mut PvStructure, bits: &BitSet) {
        for bit in bits.iter() {
            self.copy_field_from_master(master, buffer, bit);
        }
    }

    /// Copy the field at copy offset `bit` (its whole selected content for a
    /// structure) from `master` into `buffer`.
    pub fn copy_field_from_master(&self, master: &PvStructure, buffer: &mut PvStructure, bit: usize) {
        self.for_each_pair(bit, |c, m| buffer.copy_subtree_from(c, master, m));
    }

    /// Copy every field named by `bits` from `buffer` into `master`.
    ///
    /// Returns the master offsets written, in ascending order, so the caller
    /// can post each of them.
    pub fn copy_to_master(&self, buffer: &PvStructure, master: &mut PvStructure, bits: &BitSet) -> Vec<usize> {
        let mut written = Vec::new();
        for bit in bits.iter() {
            self.for_each_pair(bit, |c, m| {
                master.copy_subtree_from(m, buffer, c);
                written.push(m);
            });
        }
        written.sort_unstable();
        written.dedup();
        written
    }

    /// Copy every selected field into `buffer` and mark the whole copy changed.
    pub fn fill_from_master(&self, master: &PvStructure, buffer: &mut PvStructure, bits: &mut BitSet) {
        for &(m, c) in &self.selected {
            buffer.copy_subtree_from(c, master, m);
        }
        bits.set(0);
    }

    /// Bring `buffer` up to date with `master`, setting in `bits` each leaf
    /// whose value changed.
    pub fn refresh_copy(&self, master: &PvStructure, buffer: &mut PvStructure, bits: &mut BitSet) {
        for &(m, c) in &self.selected {
            let end = self.copy.fields()[c].next_offset();
            for copy_offset in c..end {
                if self.copy.fields()[copy_offset].is_structure() {
                    continue;
                }
                let master_offset = m + (copy_offset - c);
                if buffer.get(copy_offset) != master.get(master_offset) {
                    buffer.copy_subtree_from(copy_offset, master, master_offset);
                    bits.set(copy_offset);
                }
            }
        }
    }

    /// Call `f(copy, master)` for each sub-tree pair covered by copy offset `bit`.
    fn for_each_pair(&self, bit: usize, mut f: impl FnMut(usize, usize)) {
        let Some(desc) = self.copy.field(bit) else {
            return;
        };
        for &(m, c) in &self.selected {
            let c_end = self.copy.fields()[c].next_offset();
            if (c..c_end).contains(&bit) {
                f(bit, m + (bit - c));
                return;
            }
            // `bit` is an ancestor of this selected root.
            if bit < c && c < desc.next_offset() {
                f(c, m);
            }
        }
    }
}

/// Type of the master sub-tree at `offset` restricted to the selected roots.
fn select_type(master: &Layout, offset: usize, selected: &[usize]) -> Option<FieldType> {
    if selected.contains(&offset) {
        return master.field_type(offset);
    }
    let end = master.fields()[offset].next_offset();
    if !selected.iter().any(|&s| s > offset && s < end) {
        return None;
    }
    let mut builder = Structure::builder();
    for child in master.children(offset) {
        match select_type(master, child, selected) {
            Some(FieldType::Structure(s)) => {
                builder = builder.add_structure(master.fields()[child].name(), s);
            }
            Some(FieldType::Scalar(st)) => builder = builder.add(master.fields()[child].name(), st),
            Some(FieldType::ScalarArray(st)) => {
                builder = builder.add_array(master.fields()[child].name(), st);
            }
            None => {}
        }
    }
    Some(FieldType::Structure(builder.build()))
}
