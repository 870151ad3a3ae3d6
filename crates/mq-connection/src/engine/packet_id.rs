//! Packet identifier allocation.

use std::collections::HashSet;

/// Hands out packet identifiers in `1..=65535`, wrapping, and never returns
/// one that is still in flight.
#[derive(Debug)]
pub(crate) struct PacketIdAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl PacketIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    /// `None` when all 65535 identifiers are in flight.
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next;
            self.next = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub(crate) fn clear(&mut self) {
        self.in_use.clear();
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_use.len()
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
