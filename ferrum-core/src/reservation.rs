//! LR/SC reservation tracking.
//!
//! The memory keeps one reservation per hart, indexed by local hart id. The
//! table itself is not thread-safe; [`crate::Memory`] wraps it in the LR
//! mutex and serializes all mutation through it.

/// A hart's active reservation, created by LR and consumed by SC.
#[derive(Debug, Default, Copy, Clone)]
struct Reservation {
    address: u64,
    size: u64,
    valid: bool,
}

impl Reservation {
    /// True if the store `[address, address + store_size)` intersects this
    /// reservation's byte range.
    fn intersects(&self, address: u64, store_size: u64) -> bool {
        if address >= self.address {
            address - self.address < self.size
        } else {
            self.address - address < store_size
        }
    }
}

/// One reservation slot per hart.
#[derive(Debug, Default)]
pub(crate) struct ReservationTable {
    slots: Vec<Reservation>,
}

impl ReservationTable {
    pub(crate) fn set_hart_count(&mut self, count: usize) {
        self.slots.resize_with(count, Default::default);
    }

    /// Set the hart's reservation, replacing any prior one.
    pub(crate) fn make(&mut self, hart: usize, address: u64, size: u64) {
        self.slots[hart] = Reservation {
            address,
            size,
            valid: true,
        };
    }

    /// True iff the hart's reservation is valid and was made for exactly
    /// `address`. A size mismatch does not by itself invalidate; callers use
    /// a matching SC width.
    pub(crate) fn has(&self, hart: usize, address: u64) -> bool {
        let res = &self.slots[hart];
        res.valid && res.address == address
    }

    pub(crate) fn invalidate(&mut self, hart: usize) {
        self.slots[hart].valid = false;
    }

    /// Clear the reservation of every hart other than `hart` whose byte
    /// range intersects the store `[address, address + store_size)`.
    pub(crate) fn invalidate_other_harts(&mut self, hart: usize, address: u64, store_size: u64) {
        for (i, res) in self.slots.iter_mut().enumerate() {
            if i != hart && res.intersects(address, store_size) {
                res.valid = false;
            }
        }
    }

    /// Clear the reservation of every hart whose byte range intersects the
    /// store `[address, address + store_size)`.
    pub(crate) fn invalidate_all(&mut self, address: u64, store_size: u64) {
        for res in &mut self.slots {
            if res.intersects(address, store_size) {
                res.valid = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(harts: usize) -> ReservationTable {
        let mut t = ReservationTable::default();
        t.set_hart_count(harts);
        t
    }

    #[test]
    fn make_and_match() {
        let mut t = table(2);
        t.make(0, 0x200, 4);
        assert!(t.has(0, 0x200));
        assert!(!t.has(0, 0x204));
        assert!(!t.has(1, 0x200));
    }

    #[test]
    fn remake_replaces() {
        let mut t = table(1);
        t.make(0, 0x200, 4);
        t.make(0, 0x300, 8);
        assert!(!t.has(0, 0x200));
        assert!(t.has(0, 0x300));
    }

    #[test]
    fn invalidate_single_hart() {
        let mut t = table(2);
        t.make(0, 0x200, 4);
        t.make(1, 0x200, 4);
        t.invalidate(0);
        assert!(!t.has(0, 0x200));
        assert!(t.has(1, 0x200));
    }

    #[test]
    fn store_into_reservation_invalidates_others_only() {
        let mut t = table(3);
        t.make(0, 0x200, 4);
        t.make(1, 0x200, 4);
        t.make(2, 0x400, 4);
        t.invalidate_other_harts(0, 0x200, 4);
        assert!(t.has(0, 0x200));
        assert!(!t.has(1, 0x200));
        assert!(t.has(2, 0x400));
    }

    #[test]
    fn overlap_is_checked_in_both_directions() {
        let mut t = table(2);
        // Store below the reservation, overlapping its first byte.
        t.make(1, 0x203, 4);
        t.invalidate_other_harts(0, 0x200, 4);
        assert!(!t.has(1, 0x203));
        // Store above the reservation, overlapping its last byte.
        t.make(1, 0x1F8, 8);
        t.invalidate_other_harts(0, 0x1FF, 1);
        assert!(!t.has(1, 0x1F8));
        // Adjacent store does not invalidate.
        t.make(1, 0x200, 4);
        t.invalidate_other_harts(0, 0x204, 4);
        t.invalidate_other_harts(0, 0x1FC, 4);
        assert!(t.has(1, 0x200));
    }

    #[test]
    fn invalidate_all_includes_own_hart() {
        let mut t = table(2);
        t.make(0, 0x200, 4);
        t.make(1, 0x202, 4);
        t.invalidate_all(0x200, 4);
        assert!(!t.has(0, 0x200));
        assert!(!t.has(1, 0x202));
    }
}
