//! Framebuffer and processing buffers
//!
//! The framebuffer holds 8-bit grey pixels in the caller's (possibly rotated)
//! orientation and can be drawn with `embedded_graphics`. Processing buffers
//! hold the panel-native image of one update and live in exactly one of the
//! engine's buffer lists at a time.

use std::ops::Range;

use embedded_graphics::pixelcolor::{Gray8, GrayColor};
use embedded_graphics::prelude::*;

use crate::epdc::lut::LutMask;
use crate::epdc::types::{AltBuffer, Rect};
use crate::epdc::waveform::PhysicalWaveform;

/// White for an electrophoretic panel
pub const WHITE: u8 = 0xFF;
/// Black for an electrophoretic panel
pub const BLACK: u8 = 0x00;

/// Caller-owned framebuffer memory
///
/// Page 0 is the visible page; further pages back alternate-buffer updates.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    phys_base: u64,
    data: Vec<u8>,
}

impl Framebuffer {
    /// Allocate `pages` full screens, cleared to white
    pub fn new(width: u32, height: u32, pages: u32, phys_base: u64) -> Self {
        let pages = pages.max(1) as usize;
        Self {
            width,
            height,
            phys_base,
            data: vec![WHITE; width as usize * height as usize * pages],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Physical address range backing the whole framebuffer memory
    pub fn phys_range(&self) -> Range<u64> {
        self.phys_base..self.phys_base + self.data.len() as u64
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u8) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = value;
        }
    }

    /// Fill a rectangle of the visible page, clipped to the screen
    pub fn fill_rect(&mut self, rect: Rect, value: u8) {
        let right = rect.right().min(self.width);
        let bottom = rect.bottom().min(self.height);
        if rect.left >= right {
            return;
        }
        for y in rect.top..bottom {
            let row = (y * self.width) as usize;
            self.data[row + rect.left as usize..row + right as usize].fill(value);
        }
    }

    /// Raw memory, all pages
    pub fn memory(&self) -> &[u8] {
        &self.data
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether an alternate buffer lies completely inside framebuffer memory
    pub fn holds(&self, alt: &AltBuffer) -> bool {
        range_holds(&self.phys_range(), alt)
    }

    /// Pixel of an alternate buffer; `None` outside memory
    pub fn alt_pixel(&self, alt: &AltBuffer, x: u32, y: u32) -> Option<u8> {
        let offset = alt.phys_addr.checked_sub(self.phys_base)?
            + y as u64 * alt.width as u64
            + x as u64;
        self.data.get(offset as usize).copied()
    }
}

impl OriginDimensions for Framebuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Framebuffer {
    type Color = Gray8;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, color.luma());
            }
        }
        Ok(())
    }
}

/// Whether `alt` lies completely inside the physical `range`
pub(crate) fn range_holds(range: &Range<u64>, alt: &AltBuffer) -> bool {
    let len = alt.width as u64 * alt.height as u64;
    alt.phys_addr >= range.start
        && alt
            .phys_addr
            .checked_add(len)
            .is_some_and(|end| end <= range.end)
}

/// Panel-native image of one update region
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    data: Vec<u8>,
    region: Rect,
}

impl ImageBuffer {
    /// Buffer able to hold `capacity` pixels
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            region: Rect::default(),
        }
    }

    /// Prepare the buffer for a new panel region
    pub fn reset(&mut self, region: Rect) {
        self.region = region;
        self.data.clear();
        self.data.resize(region.area(), WHITE);
    }

    /// Panel region the pixels belong to
    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn stride(&self) -> u32 {
        self.region.width
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pixel at region-local coordinates
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.region.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        let stride = self.region.width;
        self.data[(y * stride + x) as usize] = value;
    }
}

/// Processing buffer: an image buffer plus the update currently bound to it
pub(crate) struct ProcBuffer {
    pub(crate) index: usize,
    /// Lent to the image processor while the update is being converted
    pub(crate) image: Option<ImageBuffer>,
    pub(crate) desc: Option<crate::epdc::driver::UpdateDesc>,
    pub(crate) lut: Option<u8>,
    /// Other LUTs this update collided with that have not completed yet
    pub(crate) collision_mask: LutMask,
    pub(crate) panel_region: Rect,
    pub(crate) waveform: Option<PhysicalWaveform>,
    /// Scan straight out of framebuffer memory
    pub(crate) zero_copy: bool,
}

impl ProcBuffer {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            image: Some(ImageBuffer::with_capacity(capacity)),
            desc: None,
            lut: None,
            collision_mask: LutMask::EMPTY,
            panel_region: Rect::default(),
            waveform: None,
            zero_copy: false,
        }
    }

    /// Unbind everything before the buffer goes back to the free list
    pub(crate) fn recycle(&mut self) -> Option<crate::epdc::driver::UpdateDesc> {
        self.lut = None;
        self.collision_mask = LutMask::EMPTY;
        self.waveform = None;
        self.zero_copy = false;
        self.desc.take()
    }
}

/// Allocate the fixed processing pool
pub(crate) fn allocate_pool(count: usize, capacity: usize) -> Vec<ProcBuffer> {
    (0..count.max(1))
        .map(|index| ProcBuffer::new(index, capacity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};

    #[test]
    fn draws_through_embedded_graphics() {
        let mut fb = Framebuffer::new(16, 8, 1, 0x1000);
        Rectangle::new(Point::new(2, 1), Size::new(3, 2))
            .into_styled(PrimitiveStyle::with_fill(Gray8::BLACK))
            .draw(&mut fb)
            .unwrap();
        assert_eq!(fb.pixel(2, 1), BLACK);
        assert_eq!(fb.pixel(4, 2), BLACK);
        assert_eq!(fb.pixel(5, 2), WHITE);
        assert_eq!(fb.pixel(2, 3), WHITE);
    }

    #[test]
    fn fill_rect_clips() {
        let mut fb = Framebuffer::new(4, 4, 1, 0);
        fb.fill_rect(Rect::new(2, 2, 10, 10), 0x80);
        assert_eq!(fb.pixel(3, 3), 0x80);
        assert_eq!(fb.pixel(1, 1), WHITE);
    }

    #[test]
    fn alternate_buffer_range() {
        let fb = Framebuffer::new(10, 10, 2, 0x1000);
        let inside = AltBuffer {
            phys_addr: 0x1000 + 100,
            width: 10,
            height: 10,
            region: Rect::new(0, 0, 10, 10),
        };
        assert!(fb.holds(&inside));
        let outside = AltBuffer {
            phys_addr: 0x1000 + 101,
            ..inside
        };
        assert!(!fb.holds(&outside));
        let below = AltBuffer {
            phys_addr: 0x0FFF,
            ..inside
        };
        assert!(!fb.holds(&below));
    }

    #[test]
    fn image_buffer_reset_sizes_to_region() {
        let mut image = ImageBuffer::with_capacity(64);
        image.reset(Rect::new(4, 4, 3, 2));
        assert_eq!(image.pixels().len(), 6);
        image.set(2, 1, BLACK);
        assert_eq!(image.get(2, 1), BLACK);
        assert_eq!(image.stride(), 3);
    }
}
