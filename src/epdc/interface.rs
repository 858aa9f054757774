//! Register interface of the update controller
//!
//! Everything revision specific is captured once in [`Capabilities`]; the
//! engine never branches on the revision itself.

use crate::epdc::buffer::ImageBuffer;
use crate::epdc::error::DisplayError;
use crate::epdc::irq::{IrqLine, IrqMask, StatusBits};
use crate::epdc::types::{Rect, UpdateMode};
use crate::epdc::waveform::PhysicalWaveform;

/// Controller generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub name: &'static str,
    pub lut_count: u8,
    /// Widest region one scan can cover
    pub max_scan_width: u32,
    /// Can scan straight out of framebuffer memory
    pub zero_copy: bool,
    /// Needs pixels quantised by the image processor
    pub native_lookup: bool,
    /// LUTs must be handed out above the highest active one
    pub lut_hazard: bool,
}

impl Revision {
    /// First generation: 16 LUTs, every update goes through the processor
    pub const V1: Revision = Revision {
        name: "v1",
        lut_count: 16,
        max_scan_width: 2048,
        zero_copy: false,
        native_lookup: true,
        lut_hazard: false,
    };

    /// Second generation: 64 LUTs and a zero-copy scan path
    pub const V2: Revision = Revision {
        name: "v2",
        lut_count: 64,
        max_scan_width: 4096,
        zero_copy: true,
        native_lookup: false,
        lut_hazard: true,
    };
}

/// Revision and panel properties resolved at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub revision: Revision,
    /// Native panel size
    pub panel_width: u32,
    pub panel_height: u32,
}

impl Capabilities {
    pub fn new(revision: Revision, panel_width: u32, panel_height: u32) -> Self {
        Self {
            revision,
            panel_width,
            panel_height,
        }
    }

    pub fn lut_count(&self) -> u8 {
        self.revision.lut_count
    }

    pub fn max_scan_width(&self) -> u32 {
        self.revision.max_scan_width.min(self.panel_width)
    }
}

/// Pixels a scan reads
#[derive(Debug, Clone, Copy)]
pub enum ScanSource<'a> {
    /// Processed working image
    Image(&'a ImageBuffer),
    /// Framebuffer memory, no processing
    Framebuffer { phys_addr: u64, stride: u32 },
}

/// Everything needed to start one update
#[derive(Debug, Clone, Copy)]
pub struct UpdateCommand<'a> {
    pub lut: u8,
    /// Panel coordinates
    pub region: Rect,
    pub waveform: PhysicalWaveform,
    pub mode: UpdateMode,
    /// Compute the working buffer and collisions only
    pub dry_run: bool,
    /// Hold the scan after the working buffer is computed
    pub pause: bool,
    pub source: ScanSource<'a>,
}

pub trait EpdcHardware: Send {
    fn capabilities(&self) -> Capabilities;

    /// Hand over the line the controller raises on any status change
    fn attach_irq(&mut self, line: IrqLine);

    /// Read every status register, clearing nothing
    fn snapshot_status(&mut self) -> StatusBits;

    /// Clear exactly the bits in `status`
    fn acknowledge(&mut self, status: &StatusBits);

    fn set_irq_mask(&mut self, mask: IrqMask);

    fn program_update(&mut self, cmd: &UpdateCommand<'_>) -> Result<(), DisplayError>;

    /// Release a paused update, scanning the refined image
    fn resume_scan(&mut self, image: &ImageBuffer) -> Result<(), DisplayError>;
}
