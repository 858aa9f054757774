/// Option flags accepted on an update request.
///
/// Combine them into an [`UpdateFlags`] value.
pub struct Flag;
#[allow(missing_docs)]
impl Flag {
    pub const NONE: u32 = 0x00;

    // Pixel transforms applied by the image processor
    pub const FORCE_MONOCHROME: u32 = 0x01; // Threshold every pixel to black or white
    pub const ENABLE_INVERSION: u32 = 0x02; // Invert grey levels

    // Source selection
    pub const USE_ALT_BUFFER: u32 = 0x04; // Read pixels from the alternate buffer

    // Dry run: compute the working buffer and report collisions, leave the panel alone
    pub const TEST_COLLISION: u32 = 0x08;

    // Ordered dithering in the refinement pass, implies a pause before the scan
    pub const USE_DITHERING: u32 = 0x10;

    pub const ALL: u32 = 0x1F;
}

/// Set of [`Flag`] bits attached to a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UpdateFlags {
    pub bits: u32,
}

impl UpdateFlags {
    pub const fn new() -> Self {
        Self { bits: Flag::NONE }
    }

    /// Unknown bits are dropped
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits: bits & Flag::ALL,
        }
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self::from_bits(self.bits | flag)
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.bits |= flag & Flag::ALL;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u32) {
        self.bits &= !flag;
    }

    #[inline]
    pub const fn is_set(&self, flag: u32) -> bool {
        (self.bits & flag) != 0
    }

    #[inline]
    pub const fn is_dry_run(&self) -> bool {
        self.is_set(Flag::TEST_COLLISION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_masked() {
        let flags = UpdateFlags::from_bits(0xFFFF_FF00 | Flag::ENABLE_INVERSION);
        assert_eq!(flags.bits, Flag::ENABLE_INVERSION);
    }

    #[test]
    fn set_and_clear() {
        let mut flags = UpdateFlags::new().with(Flag::TEST_COLLISION);
        assert!(flags.is_dry_run());
        flags.set(Flag::FORCE_MONOCHROME);
        flags.clear_flag(Flag::TEST_COLLISION);
        assert!(!flags.is_dry_run());
        assert!(flags.is_set(Flag::FORCE_MONOCHROME));
    }
}
