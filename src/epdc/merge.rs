//! Merge engine
//!
//! Collapses compatible, geometrically adjacent updates into one. A merge is
//! all-or-nothing: the surviving descriptor is only touched once every check
//! has passed.

use crate::epdc::driver::UpdateDesc;
use crate::epdc::types::UpdateMode;

/// Why two updates were not merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRefusal {
    /// Dry-run probe, or different options on different regions. Later
    /// updates must not overtake this one.
    Blocked,
    /// Regions neither overlap nor touch
    Disjoint,
    /// Combined panel region exceeds the scan width limit
    TooWide,
}

/// Fold `other` into `into`.
///
/// On success `other` has given up its markers and is to be discarded.
pub(crate) fn merge(
    into: &mut UpdateDesc,
    other: &mut UpdateDesc,
    max_scan_width: u32,
) -> Result<(), MergeRefusal> {
    let (a, b) = (&into.request, &other.request);
    if a.flags.is_dry_run() || b.flags.is_dry_run() {
        return Err(MergeRefusal::Blocked);
    }
    let identical = a.region == b.region;
    if !identical && !a.same_options(b) {
        return Err(MergeRefusal::Blocked);
    }
    if !a.region.touches(&b.region) {
        return Err(MergeRefusal::Disjoint);
    }
    let panel_region = into.panel_region.union(&other.panel_region);
    if panel_region.width > max_scan_width {
        return Err(MergeRefusal::TooWide);
    }

    // the later request carries the caller's latest intent
    let other_is_later = other.order >= into.order;
    let region = a.region.union(&b.region);
    let waveform = if b.waveform.fidelity() > a.waveform.fidelity() {
        b.waveform
    } else {
        a.waveform
    };
    let mode = if a.mode == UpdateMode::Full || b.mode == UpdateMode::Full {
        UpdateMode::Full
    } else {
        UpdateMode::Partial
    };
    if other_is_later {
        into.request.flags = b.flags;
        into.request.alt_buffer = b.alt_buffer;
        into.request.temperature = b.temperature;
    }

    into.request.region = region;
    into.request.waveform = waveform;
    into.request.mode = mode;
    into.panel_region = panel_region;
    into.order = into.order.max(other.order);
    into.markers.append(&mut other.markers);
    log::debug!(
        "Merged update {} into {} -> {} {}",
        other.order,
        into.order,
        region,
        waveform
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epdc::flag::{Flag, UpdateFlags};
    use crate::epdc::types::{Rect, UpdateRequest, WaveformMode};

    fn desc(order: u64, region: Rect, waveform: WaveformMode, mode: UpdateMode) -> UpdateDesc {
        UpdateDesc::new(UpdateRequest::new(region, waveform, mode), region, order, vec![order])
    }

    #[test]
    fn overlapping_updates_combine() {
        let mut a = desc(1, Rect::new(0, 0, 100, 100), WaveformMode::DirectUpdate, UpdateMode::Full);
        let mut b = desc(2, Rect::new(50, 50, 100, 100), WaveformMode::FourLevel, UpdateMode::Partial);
        merge(&mut a, &mut b, 2048).unwrap();
        assert_eq!(a.request.region, Rect::new(0, 0, 150, 150));
        assert_eq!(a.panel_region, Rect::new(0, 0, 150, 150));
        assert_eq!(a.request.mode, UpdateMode::Full);
        assert_eq!(a.request.waveform, WaveformMode::FourLevel);
        assert_eq!(a.order, 2);
        assert_eq!(a.markers, vec![1, 2]);
        assert!(b.markers.is_empty());
    }

    #[test]
    fn equal_rank_keeps_existing_waveform() {
        let r = Rect::new(0, 0, 10, 10);
        let mut a = desc(1, r, WaveformMode::Refined, UpdateMode::Partial);
        let mut b = desc(2, r, WaveformMode::RefinedDithered, UpdateMode::Partial);
        merge(&mut a, &mut b, 2048).unwrap();
        assert_eq!(a.request.waveform, WaveformMode::Refined);
    }

    #[test]
    fn dry_run_blocks() {
        let r = Rect::new(0, 0, 10, 10);
        let mut a = desc(1, r, WaveformMode::Auto, UpdateMode::Partial);
        let mut b = desc(2, r, WaveformMode::Auto, UpdateMode::Partial);
        b.request.flags = UpdateFlags::new().with(Flag::TEST_COLLISION);
        assert_eq!(merge(&mut a, &mut b, 2048), Err(MergeRefusal::Blocked));
    }

    #[test]
    fn option_mismatch_needs_identical_regions() {
        let mut a = desc(1, Rect::new(0, 0, 10, 10), WaveformMode::Auto, UpdateMode::Partial);
        let mut b = desc(2, Rect::new(5, 0, 10, 10), WaveformMode::Auto, UpdateMode::Partial);
        b.request.flags = UpdateFlags::new().with(Flag::ENABLE_INVERSION);
        assert_eq!(merge(&mut a, &mut b, 2048), Err(MergeRefusal::Blocked));

        b.request.region = a.request.region;
        b.panel_region = a.panel_region;
        merge(&mut a, &mut b, 2048).unwrap();
        assert!(a.request.flags.is_set(Flag::ENABLE_INVERSION));
    }

    #[test]
    fn disjoint_and_too_wide_leave_survivor_untouched() {
        let mut a = desc(5, Rect::new(0, 0, 10, 10), WaveformMode::FastFlash, UpdateMode::Partial);
        let before = a.clone();
        let mut far = desc(6, Rect::new(100, 100, 10, 10), WaveformMode::FullGrey, UpdateMode::Full);
        assert_eq!(merge(&mut a, &mut far, 2048), Err(MergeRefusal::Disjoint));
        let mut wide = desc(7, Rect::new(10, 0, 20, 10), WaveformMode::FullGrey, UpdateMode::Full);
        assert_eq!(merge(&mut a, &mut wide, 16), Err(MergeRefusal::TooWide));
        assert_eq!(a, before);
        assert_eq!(wide.markers, vec![7]);
    }

    #[test]
    fn earlier_sibling_does_not_override_options() {
        let r = Rect::new(0, 0, 10, 10);
        let mut later = desc(9, r, WaveformMode::Auto, UpdateMode::Partial);
        let mut earlier = desc(3, r, WaveformMode::Auto, UpdateMode::Partial);
        earlier.request.flags = UpdateFlags::new().with(Flag::FORCE_MONOCHROME);
        merge(&mut later, &mut earlier, 2048).unwrap();
        assert!(!later.request.flags.is_set(Flag::FORCE_MONOCHROME));
        assert_eq!(later.order, 9);
    }
}
