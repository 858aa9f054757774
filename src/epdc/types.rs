//! Types shared by the update engine and its callers

use serde::{Deserialize, Serialize};

use crate::epdc::error::Error;
use crate::epdc::flag::UpdateFlags;

/// Axis-aligned rectangle in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Exclusive right edge
    pub const fn right(&self) -> u32 {
        self.left + self.width
    }

    /// Exclusive bottom edge
    pub const fn bottom(&self) -> u32 {
        self.top + self.height
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// True when `other` lies completely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// True when the two rectangles share at least one pixel
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.left < other.right()
            && other.left < self.right()
            && self.top < other.bottom()
            && other.top < self.bottom()
    }

    /// True when the rectangles overlap or share an edge
    pub fn touches(&self, other: &Rect) -> bool {
        self.left <= other.right()
            && other.left <= self.right()
            && self.top <= other.bottom()
            && other.top <= self.bottom()
    }

    /// Bounding rectangle of both
    pub fn union(&self, other: &Rect) -> Rect {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        Rect {
            left,
            top,
            width: self.right().max(other.right()) - left,
            height: self.bottom().max(other.bottom()) - top,
        }
    }

    /// Map a rectangle given in the rotated (caller) space onto the panel.
    ///
    /// `panel_width` and `panel_height` are the native panel dimensions.
    pub fn to_panel(&self, rotation: Rotation, panel_width: u32, panel_height: u32) -> Rect {
        match rotation {
            Rotation::Rotate0 => *self,
            Rotation::Rotate90 => Rect {
                left: panel_width - self.top - self.height,
                top: self.left,
                width: self.height,
                height: self.width,
            },
            Rotation::Rotate180 => Rect {
                left: panel_width - self.left - self.width,
                top: panel_height - self.top - self.height,
                width: self.width,
                height: self.height,
            },
            Rotation::Rotate270 => Rect {
                left: self.top,
                top: panel_height - self.left - self.width,
                width: self.height,
                height: self.width,
            },
        }
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

/// Orientation of the caller's framebuffer relative to the panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Rotate0,
    /// Clockwise
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Whether width and height swap between caller space and the panel
    pub const fn is_transposed(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

/// Full refresh drives every pixel in the region, partial only changed ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Partial,
    Full,
}

impl TryFrom<u32> for UpdateMode {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(UpdateMode::Partial),
            1 => Ok(UpdateMode::Full),
            other => Err(Error::InvalidUpdateMode(other)),
        }
    }
}

/// Logical visual transition requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveformMode {
    /// Let the engine pick from the pixel content
    Auto,
    /// Fast monochrome flashing transition
    FastFlash,
    /// Monochrome direct update
    DirectUpdate,
    /// Four grey levels
    FourLevel,
    FastPartialGrey,
    /// Regional anti-ghosting transition, needs a refinement pass
    Refined,
    /// Anti-ghosting transition on dithered content
    RefinedDithered,
    FastFullGrey,
    FullGrey,
}

impl WaveformMode {
    pub const ALL: [WaveformMode; 9] = [
        WaveformMode::Auto,
        WaveformMode::FastFlash,
        WaveformMode::DirectUpdate,
        WaveformMode::FourLevel,
        WaveformMode::FastPartialGrey,
        WaveformMode::Refined,
        WaveformMode::RefinedDithered,
        WaveformMode::FastFullGrey,
        WaveformMode::FullGrey,
    ];

    /// Visual fidelity rank used when two updates merge; higher wins
    pub const fn fidelity(self) -> u8 {
        match self {
            WaveformMode::FullGrey => 7,
            WaveformMode::FastFullGrey => 6,
            WaveformMode::Refined | WaveformMode::RefinedDithered => 5,
            WaveformMode::FastPartialGrey => 4,
            WaveformMode::FourLevel => 3,
            WaveformMode::DirectUpdate => 2,
            WaveformMode::FastFlash => 1,
            WaveformMode::Auto => 0,
        }
    }

    /// Refined transitions pause the pipeline between working-buffer
    /// computation and the panel scan
    pub const fn is_refined(self) -> bool {
        matches!(self, WaveformMode::Refined | WaveformMode::RefinedDithered)
    }
}

impl TryFrom<u32> for WaveformMode {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .get(raw as usize)
            .copied()
            .ok_or(Error::InvalidWaveform(raw))
    }
}

impl std::fmt::Display for WaveformMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WaveformMode::Auto => "auto",
            WaveformMode::FastFlash => "fast-flash",
            WaveformMode::DirectUpdate => "direct-update",
            WaveformMode::FourLevel => "4-level",
            WaveformMode::FastPartialGrey => "fast-partial-greyscale",
            WaveformMode::Refined => "refined",
            WaveformMode::RefinedDithered => "refined-dithered",
            WaveformMode::FastFullGrey => "fast-full-greyscale",
            WaveformMode::FullGrey => "full-greyscale",
        };
        f.write_str(name)
    }
}

/// Where the temperature used for waveform selection comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TemperaturePolicy {
    /// Last value given to `Epdc::set_temperature`
    #[default]
    Ambient,
    /// Read the panel temperature sensor for this update
    Sensor,
    /// Caller-supplied value in degrees Celsius
    Fixed(i32),
}

/// Alternate source buffer inside the framebuffer memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltBuffer {
    /// Physical address of the first pixel
    pub phys_addr: u64,
    pub width: u32,
    pub height: u32,
    /// Region of the alternate buffer copied into the update region
    pub region: Rect,
}

/// A caller's "redraw this region" request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub region: Rect,
    pub waveform: WaveformMode,
    pub mode: UpdateMode,
    pub flags: UpdateFlags,
    pub temperature: TemperaturePolicy,
    /// Opaque id handed back through the marker
    pub marker: Option<u32>,
    pub alt_buffer: Option<AltBuffer>,
}

impl UpdateRequest {
    pub fn new(region: Rect, waveform: WaveformMode, mode: UpdateMode) -> Self {
        Self {
            region,
            waveform,
            mode,
            flags: UpdateFlags::new(),
            temperature: TemperaturePolicy::default(),
            marker: None,
            alt_buffer: None,
        }
    }

    /// Request from the raw numbers of a register-style interface; unknown
    /// flag bits are dropped
    pub fn from_raw(region: Rect, waveform: u32, mode: u32, flags: u32) -> Result<Self, Error> {
        Ok(Self::new(
            region,
            WaveformMode::try_from(waveform)?,
            UpdateMode::try_from(mode)?,
        )
        .flags(UpdateFlags::from_bits(flags)))
    }

    #[must_use]
    pub fn flags(mut self, flags: UpdateFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn marker(mut self, id: u32) -> Self {
        self.marker = Some(id);
        self
    }

    #[must_use]
    pub fn temperature(mut self, temperature: TemperaturePolicy) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn alt_buffer(mut self, alt: AltBuffer) -> Self {
        self.alt_buffer = Some(alt);
        self.flags.set(crate::epdc::flag::Flag::USE_ALT_BUFFER);
        self
    }

    /// Options compared by the merge engine
    pub(crate) fn same_options(&self, other: &UpdateRequest) -> bool {
        self.flags == other.flags && self.alt_buffer == other.alt_buffer
    }
}

/// Result delivered to a marker once its update is visible
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Set for dry-run updates that would have collided
    pub collision_detected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touching_rectangles_are_not_overlapping() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert!(a.touches(&b));
        assert!(!a.overlaps(&b));
        assert_eq!(a.union(&b), Rect::new(0, 0, 20, 10));
    }

    #[test]
    fn union_of_overlapping_full_and_partial() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert_eq!(a.union(&b), Rect::new(0, 0, 150, 150));
    }

    #[test]
    fn rotation_maps_into_panel() {
        // 800x600 panel viewed in portrait
        let r = Rect::new(10, 20, 30, 40);
        let p = r.to_panel(Rotation::Rotate90, 800, 600);
        assert_eq!(p, Rect::new(800 - 20 - 40, 10, 40, 30));
        let p = r.to_panel(Rotation::Rotate270, 800, 600);
        assert_eq!(p, Rect::new(20, 600 - 10 - 30, 40, 30));
        let p = r.to_panel(Rotation::Rotate180, 800, 600);
        assert_eq!(p, Rect::new(800 - 10 - 30, 600 - 20 - 40, 30, 40));
    }

    #[test]
    fn raw_modes_are_checked() {
        assert_eq!(UpdateMode::try_from(1).ok(), Some(UpdateMode::Full));
        assert!(matches!(
            UpdateMode::try_from(7),
            Err(Error::InvalidUpdateMode(7))
        ));
        assert!(matches!(
            WaveformMode::try_from(42),
            Err(Error::InvalidWaveform(42))
        ));
        let request = UpdateRequest::from_raw(Rect::new(0, 0, 8, 8), 8, 0, 0x100 | 0x02).unwrap();
        assert_eq!(request.waveform, WaveformMode::FullGrey);
        assert_eq!(request.flags.bits, 0x02);
        assert!(UpdateRequest::from_raw(Rect::new(0, 0, 8, 8), 0, 2, 0).is_err());
    }

    #[test]
    fn refined_variants_share_a_rank() {
        assert_eq!(
            WaveformMode::Refined.fidelity(),
            WaveformMode::RefinedDithered.fidelity()
        );
        assert!(WaveformMode::FullGrey.fidelity() > WaveformMode::FastFullGrey.fidelity());
        assert!(WaveformMode::DirectUpdate.fidelity() > WaveformMode::Auto.fidelity());
    }
}
