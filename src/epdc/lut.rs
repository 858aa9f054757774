//! LUT slot allocation and collision bookkeeping
//!
//! Every in-flight scan owns one hardware LUT. The table remembers the
//! processing order of the owner so a colliding update can tell whether the
//! slot it collided with belongs to newer work.

use std::time::Instant;

/// Maximum number of LUTs any revision exposes
pub const MAX_LUTS: u8 = 64;

/// Bit set of LUT slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LutMask(pub u64);

impl LutMask {
    pub const EMPTY: LutMask = LutMask(0);

    /// Mask with slots `0..count` set
    pub const fn first(count: u8) -> Self {
        if count >= 64 {
            LutMask(u64::MAX)
        } else {
            LutMask((1u64 << count) - 1)
        }
    }

    pub const fn single(lut: u8) -> Self {
        LutMask(1u64 << lut)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, lut: u8) -> bool {
        self.0 & (1u64 << lut) != 0
    }

    pub fn insert(&mut self, lut: u8) {
        self.0 |= 1u64 << lut;
    }

    pub fn remove(&mut self, lut: u8) {
        self.0 &= !(1u64 << lut);
    }

    pub const fn union(self, other: LutMask) -> LutMask {
        LutMask(self.0 | other.0)
    }

    pub const fn without(self, other: LutMask) -> LutMask {
        LutMask(self.0 & !other.0)
    }

    pub const fn intersection(self, other: LutMask) -> LutMask {
        LutMask(self.0 & other.0)
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn lowest(self) -> Option<u8> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as u8)
    }

    pub fn highest(self) -> Option<u8> {
        (!self.is_empty()).then(|| 63 - self.0.leading_zeros() as u8)
    }

    /// Slot numbers in ascending order
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..MAX_LUTS).filter(move |&lut| self.contains(lut))
    }
}

impl FromIterator<u8> for LutMask {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut mask = LutMask::EMPTY;
        for lut in iter {
            mask.insert(lut);
        }
        mask
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Processing order of the owning update, 0 when free
    order: u64,
    deadline: Option<Instant>,
}

/// Ownership table for the hardware LUTs
#[derive(Debug)]
pub struct LutTable {
    slots: Vec<Slot>,
    leaked: LutMask,
    hazard_ordering: bool,
}

impl LutTable {
    pub fn new(count: u8, hazard_ordering: bool) -> Self {
        let count = count.clamp(1, MAX_LUTS);
        Self {
            slots: vec![Slot::default(); count as usize],
            leaked: LutMask::EMPTY,
            hazard_ordering,
        }
    }

    pub fn count(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Slots currently owned by an update
    pub fn active(&self) -> LutMask {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.order != 0)
            .map(|(lut, _)| lut as u8)
            .collect()
    }

    /// Slots abandoned after a hardware timeout
    pub fn leaked(&self) -> LutMask {
        self.leaked
    }

    /// Slots that must not be handed out
    pub fn used(&self) -> LutMask {
        self.active().union(self.leaked)
    }

    pub fn available(&self) -> bool {
        !LutMask::first(self.count()).without(self.used()).is_empty()
    }

    /// Pick a free slot.
    ///
    /// With hazard ordering the pick is the lowest free slot above the highest
    /// used one, wrapping to the lowest free slot.
    pub fn allocate(&self) -> Option<u8> {
        let used = self.used();
        let free = LutMask::first(self.count()).without(used);
        let lowest = free.lowest()?;
        if !self.hazard_ordering {
            return Some(lowest);
        }
        match used.highest() {
            Some(highest) => Some(free.iter().find(|&lut| lut > highest).unwrap_or(lowest)),
            None => Some(lowest),
        }
    }

    pub fn claim(&mut self, lut: u8, order: u64, deadline: Instant) {
        debug_assert!(order != 0, "processing order starts at 1");
        let slot = &mut self.slots[lut as usize];
        debug_assert!(slot.order == 0, "LUT {} claimed twice", lut);
        slot.order = order;
        slot.deadline = Some(deadline);
    }

    /// Free a slot whose completion was reported. Returns false for slots that
    /// were not owned, including leaked ones.
    pub fn release(&mut self, lut: u8) -> bool {
        match self.slots.get_mut(lut as usize) {
            Some(slot) if slot.order != 0 => {
                *slot = Slot::default();
                true
            }
            _ => false,
        }
    }

    /// Drop every reference to a stuck slot and never hand it out again
    pub fn leak(&mut self, lut: u8) {
        if let Some(slot) = self.slots.get_mut(lut as usize) {
            *slot = Slot::default();
            self.leaked.insert(lut);
        }
    }

    pub fn owner_order(&self, lut: u8) -> u64 {
        self.slots.get(lut as usize).map_or(0, |slot| slot.order)
    }

    /// True when every slot in `mask` belongs to an update newer than `order`
    pub fn all_newer(&self, mask: LutMask, order: u64) -> bool {
        !mask.is_empty() && mask.iter().all(|lut| self.owner_order(lut) > order)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|slot| slot.deadline).min()
    }

    /// Slots whose deadline has passed
    pub fn expired(&self, now: Instant) -> LutMask {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.deadline.is_some_and(|d| d <= now))
            .map(|(lut, _)| lut as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn mask_bit_helpers() {
        let mask: LutMask = [1u8, 5, 63].into_iter().collect();
        assert_eq!(mask.lowest(), Some(1));
        assert_eq!(mask.highest(), Some(63));
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 5, 63]);
        assert_eq!(LutMask::first(64), LutMask(u64::MAX));
        assert_eq!(LutMask::first(3), LutMask(0b111));
    }

    #[test]
    fn plain_allocation_takes_lowest_free() {
        let mut table = LutTable::new(4, false);
        table.claim(0, 1, later());
        table.claim(2, 2, later());
        assert_eq!(table.allocate(), Some(1));
    }

    #[test]
    fn hazard_ordering_skips_above_highest_and_wraps() {
        let mut table = LutTable::new(4, true);
        table.claim(0, 1, later());
        table.claim(1, 2, later());
        assert_eq!(table.allocate(), Some(2));
        table.release(0);
        // slot 0 is free but lower than the highest active slot
        assert_eq!(table.allocate(), Some(2));
        table.claim(3, 3, later());
        // highest slot is active: wrap to the lowest free one
        assert_eq!(table.allocate(), Some(0));
    }

    #[test]
    fn exhausted_table_has_nothing_to_give() {
        let mut table = LutTable::new(2, false);
        table.claim(0, 1, later());
        table.claim(1, 2, later());
        assert!(!table.available());
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn leaked_slot_is_never_reused() {
        let mut table = LutTable::new(2, false);
        table.claim(0, 1, later());
        table.leak(0);
        assert!(table.active().is_empty());
        assert_eq!(table.allocate(), Some(1));
        // a late completion for the leaked slot changes nothing
        assert!(!table.release(0));
        assert!(table.leaked().contains(0));
    }

    #[test]
    fn moot_check_needs_every_owner_newer() {
        let mut table = LutTable::new(4, false);
        table.claim(0, 10, later());
        table.claim(1, 3, later());
        assert!(table.all_newer(LutMask::single(0), 5));
        assert!(!table.all_newer([0u8, 1].into_iter().collect(), 5));
        assert!(!table.all_newer(LutMask::EMPTY, 5));
    }

    #[test]
    fn deadlines_expire() {
        let mut table = LutTable::new(2, false);
        let now = Instant::now();
        table.claim(1, 1, now);
        assert_eq!(table.expired(now), LutMask::single(1));
        assert_eq!(table.next_deadline(), Some(now));
        table.release(1);
        assert!(table.expired(now).is_empty());
    }
}
