//! Image processor interface
//!
//! The processor converts a framebuffer region into the panel-native working
//! image: rotation, inversion, monochrome thresholding and the grey-level
//! lookup some controller revisions need. Jobs complete asynchronously through
//! a [`JobCompletion`]; the engine blocks on it without holding its queue lock.

use std::sync::{Arc, PoisonError, RwLock};

use futures::channel::oneshot;

use crate::epdc::buffer::{Framebuffer, ImageBuffer, BLACK, WHITE};
use crate::epdc::types::{AltBuffer, Rect, Rotation, WaveformMode};

/// Id the processor assigns to a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle(pub u64);

/// Pixel transforms for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformFlags {
    pub rotation: Rotation,
    pub invert: bool,
    pub monochrome: bool,
    /// Quantise to the 16 grey levels the controller's lookup stage expects
    pub native_lookup: bool,
}

impl TransformFlags {
    pub fn is_identity(&self) -> bool {
        self.rotation == Rotation::Rotate0 && !self.invert && !self.monochrome && !self.native_lookup
    }
}

/// Where the job reads its pixels from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Framebuffer,
    Alternate(AltBuffer),
}

pub struct ProcessJob {
    /// Region in the caller's coordinate space
    pub src_region: Rect,
    /// Same region mapped onto the panel
    pub panel_region: Rect,
    pub source: FrameSource,
    pub transform: TransformFlags,
    pub frame: Arc<RwLock<Framebuffer>>,
    /// Destination, handed back in [`ProcessOutput`]
    pub dst: ImageBuffer,
}

pub struct ProcessOutput {
    pub image: ImageBuffer,
    pub histogram: Histogram,
}

/// Completion callback of one job; fires at most once.
///
/// Dropping it without calling [`JobCompletion::complete`] fails the job.
pub struct JobCompletion {
    tx: oneshot::Sender<anyhow::Result<ProcessOutput>>,
}

impl JobCompletion {
    pub(crate) fn new() -> (Self, oneshot::Receiver<anyhow::Result<ProcessOutput>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn complete(self, result: anyhow::Result<ProcessOutput>) {
        // the engine may already have given up on the job
        let _ = self.tx.send(result);
    }
}

pub trait ImageProcessor: Send {
    fn submit(&mut self, job: ProcessJob, done: JobCompletion) -> anyhow::Result<JobHandle>;
}

/// Set of grey levels present in an image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Histogram {
    seen: [u64; 4],
}

impl Histogram {
    pub fn from_pixels(pixels: impl IntoIterator<Item = u8>) -> Self {
        let mut histogram = Histogram::default();
        for value in pixels {
            histogram.record(value);
        }
        histogram
    }

    /// Histogram of a framebuffer region, used on the zero-copy path
    pub fn of_region(frame: &Framebuffer, region: Rect) -> Self {
        let mut histogram = Histogram::default();
        for y in region.top..region.bottom() {
            for x in region.left..region.right() {
                histogram.record(frame.pixel(x, y));
            }
        }
        histogram
    }

    #[inline]
    pub fn record(&mut self, value: u8) {
        self.seen[(value >> 6) as usize] |= 1u64 << (value & 0x3F);
    }

    pub fn contains(&self, value: u8) -> bool {
        self.seen[(value >> 6) as usize] & (1u64 << (value & 0x3F)) != 0
    }

    /// Number of distinct grey levels
    pub fn levels(&self) -> u32 {
        self.seen.iter().map(|word| word.count_ones()).sum()
    }

    fn only(&self, allowed: &[u8]) -> bool {
        let mut mask = Histogram::default();
        for &value in allowed {
            mask.record(value);
        }
        self.seen
            .iter()
            .zip(mask.seen.iter())
            .all(|(seen, allowed)| seen & !allowed == 0)
    }

    /// Waveform an automatic update resolves to for this content
    pub fn suggested_waveform(&self) -> WaveformMode {
        if self.only(&[BLACK, WHITE]) {
            WaveformMode::DirectUpdate
        } else if self.only(&[0x00, 0x55, 0xAA, 0xFF]) {
            WaveformMode::FourLevel
        } else {
            WaveformMode::FullGrey
        }
    }
}

/// Panel coordinate to caller coordinate, inverse of [`Rect::to_panel`]
fn to_caller(rotation: Rotation, x: u32, y: u32, panel_width: u32, panel_height: u32) -> (u32, u32) {
    match rotation {
        Rotation::Rotate0 => (x, y),
        Rotation::Rotate90 => (y, panel_width - 1 - x),
        Rotation::Rotate180 => (panel_width - 1 - x, panel_height - 1 - y),
        Rotation::Rotate270 => (panel_height - 1 - y, x),
    }
}

/// Apply a job on the calling thread
pub fn process(job: ProcessJob) -> anyhow::Result<ProcessOutput> {
    let ProcessJob {
        src_region,
        panel_region,
        source,
        transform,
        frame,
        mut dst,
    } = job;

    let frame = frame.read().unwrap_or_else(PoisonError::into_inner);
    let (panel_width, panel_height) = if transform.rotation.is_transposed() {
        (frame.height(), frame.width())
    } else {
        (frame.width(), frame.height())
    };
    if panel_region.right() > panel_width || panel_region.bottom() > panel_height {
        anyhow::bail!("panel region {} outside {}x{}", panel_region, panel_width, panel_height);
    }

    dst.reset(panel_region);
    let mut histogram = Histogram::default();
    for py in 0..panel_region.height {
        for px in 0..panel_region.width {
            let (cx, cy) = to_caller(
                transform.rotation,
                panel_region.left + px,
                panel_region.top + py,
                panel_width,
                panel_height,
            );
            let (dx, dy) = (cx - src_region.left, cy - src_region.top);
            let mut value = match &source {
                FrameSource::Framebuffer => frame.pixel(cx, cy),
                FrameSource::Alternate(alt) => frame
                    .alt_pixel(alt, alt.region.left + dx, alt.region.top + dy)
                    .ok_or_else(|| anyhow::anyhow!("alternate buffer read past memory"))?,
            };
            if transform.invert {
                value = !value;
            }
            if transform.monochrome {
                value = if value >= 0x80 { WHITE } else { BLACK };
            }
            if transform.native_lookup {
                value = (value >> 4) * 0x11;
            }
            histogram.record(value);
            dst.set(px, py, value);
        }
    }
    Ok(ProcessOutput {
        image: dst,
        histogram,
    })
}

/// Processor running jobs on the CPU.
///
/// By default a job completes before `submit` returns. With
/// [`SoftwareProcessor::threaded`] every job runs on its own thread, which
/// behaves like a DMA engine calling back from interrupt context.
#[derive(Debug, Default)]
pub struct SoftwareProcessor {
    next_job: u64,
    threaded: bool,
}

impl SoftwareProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threaded() -> Self {
        Self {
            next_job: 0,
            threaded: true,
        }
    }
}

impl ImageProcessor for SoftwareProcessor {
    fn submit(&mut self, job: ProcessJob, done: JobCompletion) -> anyhow::Result<JobHandle> {
        self.next_job += 1;
        let handle = JobHandle(self.next_job);
        log::debug!(
            "Processing job {} for {} ({:?})",
            handle.0,
            job.panel_region,
            job.transform
        );
        if self.threaded {
            std::thread::Builder::new()
                .name("pxp-job".into())
                .spawn(move || done.complete(process(job)))?;
        } else {
            done.complete(process(job));
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn frame_with_gradient(width: u32, height: u32) -> Arc<RwLock<Framebuffer>> {
        let mut fb = Framebuffer::new(width, height, 2, 0x8000_0000);
        for y in 0..height {
            for x in 0..width {
                fb.set_pixel(x, y, (y * width + x) as u8);
            }
        }
        Arc::new(RwLock::new(fb))
    }

    fn job(frame: &Arc<RwLock<Framebuffer>>, src: Rect, panel: Rect, transform: TransformFlags) -> ProcessJob {
        ProcessJob {
            src_region: src,
            panel_region: panel,
            source: FrameSource::Framebuffer,
            transform,
            frame: frame.clone(),
            dst: ImageBuffer::with_capacity(64),
        }
    }

    #[test]
    fn identity_copies_region() {
        let frame = frame_with_gradient(8, 4);
        let r = Rect::new(2, 1, 3, 2);
        let out = process(job(&frame, r, r, TransformFlags::default())).unwrap();
        assert_eq!(out.image.pixels(), &[10, 11, 12, 18, 19, 20]);
        assert_eq!(out.histogram.levels(), 6);
    }

    #[test]
    fn rotation_reads_through_inverse_mapping() {
        // caller sees 4 wide, 8 tall; panel is 8x4
        let frame = frame_with_gradient(4, 8);
        let src = Rect::new(1, 2, 2, 1);
        let panel = src.to_panel(Rotation::Rotate90, 8, 4);
        let transform = TransformFlags {
            rotation: Rotation::Rotate90,
            ..Default::default()
        };
        let out = process(job(&frame, src, panel, transform)).unwrap();
        assert_eq!(panel, Rect::new(5, 1, 1, 2));
        // caller pixels (1,2) and (2,2) land top to bottom on the panel
        assert_eq!(out.image.pixels(), &[9, 10]);
    }

    #[test]
    fn invert_and_threshold() {
        let frame = frame_with_gradient(16, 16);
        {
            let mut fb = frame.write().unwrap();
            fb.set_pixel(0, 0, 0x10);
            fb.set_pixel(1, 0, 0xF0);
        }
        let r = Rect::new(0, 0, 2, 1);
        let transform = TransformFlags {
            invert: true,
            monochrome: true,
            ..Default::default()
        };
        let out = process(job(&frame, r, r, transform)).unwrap();
        assert_eq!(out.image.pixels(), &[WHITE, BLACK]);
        assert_eq!(out.histogram.suggested_waveform(), WaveformMode::DirectUpdate);
    }

    #[test]
    fn native_lookup_quantises() {
        let frame = frame_with_gradient(16, 16);
        frame.write().unwrap().set_pixel(0, 0, 0x7F);
        let r = Rect::new(0, 0, 1, 1);
        let transform = TransformFlags {
            native_lookup: true,
            ..Default::default()
        };
        let out = process(job(&frame, r, r, transform)).unwrap();
        assert_eq!(out.image.get(0, 0), 0x77);
    }

    #[test]
    fn histogram_picks_waveform() {
        assert_eq!(
            Histogram::from_pixels([0x00, 0x55, 0xFF]).suggested_waveform(),
            WaveformMode::FourLevel
        );
        assert_eq!(
            Histogram::from_pixels([0x00, 0x42]).suggested_waveform(),
            WaveformMode::FullGrey
        );
        assert!(Histogram::from_pixels([0xC3]).contains(0xC3));
    }

    #[test]
    fn alternate_source_reads_second_page() {
        let frame = frame_with_gradient(4, 4);
        frame.write().unwrap().memory_mut()[16 + 5] = 0x42;
        let alt = AltBuffer {
            phys_addr: 0x8000_0000 + 16,
            width: 4,
            height: 4,
            region: Rect::new(1, 1, 1, 1),
        };
        let target = Rect::new(3, 3, 1, 1);
        let mut j = job(&frame, target, target, TransformFlags::default());
        j.source = FrameSource::Alternate(alt);
        let out = process(j).unwrap();
        assert_eq!(out.image.get(0, 0), 0x42);
    }

    #[test]
    fn threaded_processor_completes_through_channel() {
        let frame = frame_with_gradient(8, 8);
        let r = Rect::new(0, 0, 2, 2);
        let mut processor = SoftwareProcessor::threaded();
        let (done, rx) = JobCompletion::new();
        let handle = processor
            .submit(job(&frame, r, r, TransformFlags::default()), done)
            .unwrap();
        assert_eq!(handle, JobHandle(1));
        let out = block_on(rx).unwrap().unwrap();
        assert_eq!(out.image.region(), r);
    }

    #[test]
    fn dropped_completion_reads_as_cancelled() {
        let (done, rx) = JobCompletion::new();
        drop(done);
        assert!(block_on(rx).is_err());
    }
}
