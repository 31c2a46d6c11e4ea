use std::collections::VecDeque;
use std::sync::Arc;

use crate::bitset::BitSet;
use crate::data::{Layout, PvStructure};
use crate::projection::Projection;

/// One snapshot buffer: copy data plus its change and overrun bits.
#[derive(Debug)]
pub struct MonitorElement {
    pub(crate) data: PvStructure,
    pub(crate) changed: BitSet,
    pub(crate) overrun: BitSet,
}

impl MonitorElement {
    fn new(projection: &Projection) -> Self {
        let bits = projection.copy_layout().len();
        Self {
            data: projection.new_buffer(),
            changed: BitSet::with_capacity(bits),
            overrun: BitSet::with_capacity(bits),
        }
    }

    /// Copy data. Only fields under a changed bit are current.
    #[must_use]
    pub fn data(&self) -> &PvStructure {
        &self.data
    }

    /// Copy offsets changed since the previous snapshot.
    #[must_use]
    pub fn changed(&self) -> &BitSet {
        &self.changed
    }

    /// Copy offsets that changed more than once; intermediate values were lost.
    #[must_use]
    pub fn overrun(&self) -> &BitSet {
        &self.overrun
    }

    pub(crate) fn clear_bits(&mut self) {
        self.changed.clear_all();
        self.overrun.clear_all();
    }

    pub(crate) fn belongs_to(&self, layout: &Arc<Layout>) -> bool {
        Arc::ptr_eq(self.data.layout(), layout)
    }
}

/// Preallocated elements split into free and ready (used) pools.
///
/// `capacity` elements can be ready at once; one more exists to accumulate
/// changes while the ready pool is full.
#[derive(Debug)]
pub(crate) struct MonitorQueue {
    free: VecDeque<MonitorElement>,
    used: VecDeque<MonitorElement>,
    capacity: usize,
}

impl MonitorQueue {
    pub(crate) fn new(projection: &Projection, capacity: usize) -> Self {
        Self {
            free: (0..=capacity).map(|_| MonitorElement::new(projection)).collect(),
            used: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn take_free(&mut self) -> Option<MonitorElement> {
        self.free.pop_front()
    }

    pub(crate) fn put_free(&mut self, element: MonitorElement) {
        self.free.push_back(element);
    }

    pub(crate) fn put_used(&mut self, element: MonitorElement) {
        self.used.push_back(element);
    }

    pub(crate) fn take_used(&mut self) -> Option<MonitorElement> {
        self.used.pop_front()
    }

    /// Return every ready element to the free pool.
    pub(crate) fn clear(&mut self) {
        self.free.extend(self.used.drain(..));
    }

    pub(crate) fn used_len(&self) -> usize {
        self.used.len()
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ScalarType, Structure};

    fn projection() -> Projection {
        let layout = Arc::new(Layout::new(&Structure::builder().add("value", ScalarType::Int).build()));
        Projection::from_request(&layout, "").unwrap()
    }

    #[test]
    fn allocates_one_spare() {
        let queue = MonitorQueue::new(&projection(), 3);
        assert_eq!(queue.capacity(), 3);
        assert_eq!(queue.free_len(), 4);
        assert_eq!(queue.used_len(), 0);
    }

    #[test]
    fn used_is_fifo_and_clear_frees() {
        let p = projection();
        let mut queue = MonitorQueue::new(&p, 2);
        let mut first = queue.take_free().unwrap();
        first.changed.set(0);
        let second = queue.take_free().unwrap();
        queue.put_used(first);
        queue.put_used(second);
        assert!(queue.take_used().unwrap().changed().get(0));
        assert_eq!(queue.used_len(), 1);
        queue.clear();
        assert_eq!(queue.used_len(), 0);
        assert_eq!(queue.free_len(), 2);
    }

    #[test]
    fn elements_know_their_layout() {
        let p = projection();
        let other = projection();
        let element = MonitorElement::new(&p);
        assert!(element.belongs_to(p.copy_layout()));
        assert!(!element.belongs_to(other.copy_layout()));
    }
}
