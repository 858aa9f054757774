//! Refinement pass run while the pipeline is paused
//!
//! Works on the processed image in place, between working-buffer computation
//! and the release of the panel scan.

use crate::epdc::buffer::{ImageBuffer, BLACK, WHITE};
use crate::epdc::types::WaveformMode;

/// Levels this close to black or white are driven fully to avoid ghosting
const SNAP_MARGIN: u8 = 0x20;

const BAYER_4X4: [[u8; 4]; 4] = [
    [0, 8, 2, 10],
    [12, 4, 14, 6],
    [3, 11, 1, 9],
    [15, 7, 13, 5],
];

/// Push near-extreme grey levels to pure black or white
pub fn snap_anti_ghost(image: &mut ImageBuffer) {
    for value in image.pixels_mut() {
        if *value < SNAP_MARGIN {
            *value = BLACK;
        } else if *value > WHITE - SNAP_MARGIN {
            *value = WHITE;
        }
    }
}

/// Ordered 4x4 dithering down to black and white.
///
/// The pattern is anchored to panel coordinates so neighbouring updates tile
/// seamlessly.
pub fn dither_ordered(image: &mut ImageBuffer) {
    let region = image.region();
    for y in 0..region.height {
        for x in 0..region.width {
            let cell = BAYER_4X4[((region.top + y) % 4) as usize][((region.left + x) % 4) as usize];
            let threshold = cell * 16 + 8;
            let value = image.get(x, y);
            image.set(x, y, if value > threshold { WHITE } else { BLACK });
        }
    }
}

/// Refinement for a paused update
pub fn refine(image: &mut ImageBuffer, waveform: WaveformMode, dither: bool) {
    if dither || waveform == WaveformMode::RefinedDithered {
        dither_ordered(image);
    } else {
        snap_anti_ghost(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epdc::types::Rect;

    fn filled(region: Rect, value: u8) -> ImageBuffer {
        let mut image = ImageBuffer::with_capacity(region.area());
        image.reset(region);
        image.pixels_mut().fill(value);
        image
    }

    #[test]
    fn snap_leaves_midtones() {
        let mut image = filled(Rect::new(0, 0, 3, 1), 0x80);
        image.set(0, 0, 0x10);
        image.set(2, 0, 0xF0);
        snap_anti_ghost(&mut image);
        assert_eq!(image.pixels(), &[BLACK, 0x80, WHITE]);
    }

    #[test]
    fn dithering_mid_grey_gives_half_coverage() {
        let mut image = filled(Rect::new(0, 0, 4, 4), 0x80);
        dither_ordered(&mut image);
        let white = image.pixels().iter().filter(|&&v| v == WHITE).count();
        assert_eq!(white, 8);
        assert!(image.pixels().iter().all(|&v| v == WHITE || v == BLACK));
    }

    #[test]
    fn extremes_survive_dithering() {
        let mut image = filled(Rect::new(3, 5, 4, 4), WHITE);
        refine(&mut image, WaveformMode::Refined, true);
        assert!(image.pixels().iter().all(|&v| v == WHITE));
        let mut image = filled(Rect::new(0, 0, 2, 2), BLACK);
        refine(&mut image, WaveformMode::RefinedDithered, false);
        assert!(image.pixels().iter().all(|&v| v == BLACK));
    }
}
