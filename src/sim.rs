//! Simulated controller
//!
//! Behaves like the register interface of a real controller closely enough to
//! drive the engine on a host: status bits latch until acknowledged, the
//! interrupt line only fires for unmasked sources, and collisions are latched
//! when an update is programmed over a region that is still being scanned.
//!
//! By default nothing completes on its own. Tests step the hardware through
//! [`SimHandle`]; [`SimHandle::set_auto_complete`] turns every update into an
//! instant one.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use display_interface::DisplayError;

use crate::epdc::buffer::ImageBuffer;
use crate::epdc::interface::{Capabilities, EpdcHardware, ScanSource, UpdateCommand};
use crate::epdc::irq::{IrqLine, IrqMask, StatusBits};
use crate::epdc::lut::LutMask;
use crate::epdc::types::{Rect, UpdateMode};
use crate::epdc::waveform::PhysicalWaveform;

/// One update as the hardware saw it
#[derive(Debug, Clone)]
pub struct SubmittedUpdate {
    pub lut: u8,
    pub region: Rect,
    pub waveform: PhysicalWaveform,
    pub mode: UpdateMode,
    pub dry_run: bool,
    pub paused: bool,
    /// Scanned straight out of framebuffer memory
    pub zero_copy: bool,
    /// Working image, absent on the zero-copy path
    pub image: Option<ImageBuffer>,
}

#[derive(Debug, Clone, Copy)]
struct WorkingBuffer {
    lut: u8,
    dry_run: bool,
    paused: bool,
    resumed: bool,
    collisions: LutMask,
}

struct SimState {
    irq: Option<IrqLine>,
    mask: IrqMask,
    status: StatusBits,
    working: Option<WorkingBuffer>,
    /// LUTs driving the panel, with their regions
    scanning: Vec<(u8, Rect)>,
    submissions: Vec<SubmittedUpdate>,
    resumes: usize,
    auto_complete: bool,
    fail_next_program: bool,
    fail_next_resume: bool,
}

impl SimState {
    fn enabled(&self) -> bool {
        let s = &self.status;
        (self.mask.wb_done && s.wb_done)
            || (self.mask.update_specified && s.update_specified)
            || (self.mask.lut_complete && !s.finished_luts().is_empty())
    }

    fn raise_if_enabled(&self) {
        if self.enabled() {
            if let Some(irq) = &self.irq {
                irq.raise();
            }
        }
    }

    /// Latch working-buffer completion, or the pause point of a held update
    fn finish_working_buffer(&mut self) -> bool {
        let Some(wb) = self.working else {
            return false;
        };
        if wb.paused && !wb.resumed {
            self.status.update_specified = true;
            return true;
        }
        self.working = None;
        self.status.wb_done = true;
        if !wb.collisions.is_empty() {
            self.status.collision = true;
            self.status.colliding_luts = self.status.colliding_luts.union(wb.collisions);
        }
        if wb.dry_run {
            // a probe never drives a pixel
            self.status.lut_cancelled.insert(wb.lut);
        }
        true
    }

    fn finish_lut(&mut self, lut: u8, cancelled: bool) -> bool {
        let Some(pos) = self.scanning.iter().position(|(l, _)| *l == lut) else {
            return false;
        };
        self.scanning.remove(pos);
        if cancelled {
            self.status.lut_cancelled.insert(lut);
        } else {
            self.status.lut_complete.insert(lut);
        }
        true
    }

    /// Run everything in flight to completion
    fn complete_all(&mut self) {
        // a held update stops at its pause point
        self.finish_working_buffer();
        for lut in self.finishable() {
            self.finish_lut(lut, false);
        }
    }

    /// Scanning LUTs, minus one still held at its pause point
    fn finishable(&self) -> Vec<u8> {
        let held = self.working.map(|wb| wb.lut);
        self.scanning
            .iter()
            .map(|(lut, _)| *lut)
            .filter(|lut| Some(*lut) != held)
            .collect()
    }
}

type SimCell = Arc<(Mutex<SimState>, Condvar)>;

fn lock(cell: &SimCell) -> MutexGuard<'_, SimState> {
    cell.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller half handed to the engine
pub struct SimulatedEpdc {
    caps: Capabilities,
    cell: SimCell,
}

/// Test half stepping the simulated hardware
#[derive(Clone)]
pub struct SimHandle {
    cell: SimCell,
}

impl SimulatedEpdc {
    pub fn new(caps: Capabilities) -> (Self, SimHandle) {
        let state = SimState {
            irq: None,
            mask: IrqMask::NORMAL,
            status: StatusBits::default(),
            working: None,
            scanning: Vec::new(),
            submissions: Vec::new(),
            resumes: 0,
            auto_complete: false,
            fail_next_program: false,
            fail_next_resume: false,
        };
        let cell = Arc::new((Mutex::new(state), Condvar::new()));
        (
            Self {
                caps,
                cell: cell.clone(),
            },
            SimHandle { cell },
        )
    }
}

impl EpdcHardware for SimulatedEpdc {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn attach_irq(&mut self, line: IrqLine) {
        lock(&self.cell).irq = Some(line);
    }

    fn snapshot_status(&mut self) -> StatusBits {
        lock(&self.cell).status
    }

    fn acknowledge(&mut self, status: &StatusBits) {
        let mut state = lock(&self.cell);
        let s = &mut state.status;
        s.lut_complete = s.lut_complete.without(status.lut_complete);
        s.lut_cancelled = s.lut_cancelled.without(status.lut_cancelled);
        if status.wb_done {
            // clearing the working-buffer bit also drops the collision status
            s.wb_done = false;
            s.collision = false;
            s.colliding_luts = LutMask::EMPTY;
        }
        if status.update_specified {
            s.update_specified = false;
        }
    }

    fn set_irq_mask(&mut self, mask: IrqMask) {
        let mut state = lock(&self.cell);
        state.mask = mask;
        state.raise_if_enabled();
    }

    fn program_update(&mut self, cmd: &UpdateCommand<'_>) -> Result<(), DisplayError> {
        let (mutex, cond) = &*self.cell;
        let mut state = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_next_program {
            state.fail_next_program = false;
            return Err(DisplayError::BusWriteError);
        }
        if let Some(stale) = state.working {
            // the engine gave up on it after a timeout
            log::warn!("Dropping stale working buffer of LUT {}", stale.lut);
        }

        let collisions: LutMask = state
            .scanning
            .iter()
            .filter(|(lut, region)| *lut != cmd.lut && region.overlaps(&cmd.region))
            .map(|(lut, _)| *lut)
            .collect();
        let (zero_copy, image) = match cmd.source {
            ScanSource::Image(image) => (false, Some(image.clone())),
            ScanSource::Framebuffer { .. } => (true, None),
        };
        state.submissions.push(SubmittedUpdate {
            lut: cmd.lut,
            region: cmd.region,
            waveform: cmd.waveform,
            mode: cmd.mode,
            dry_run: cmd.dry_run,
            paused: cmd.pause,
            zero_copy,
            image,
        });
        if !cmd.dry_run {
            state.scanning.push((cmd.lut, cmd.region));
        }
        state.working = Some(WorkingBuffer {
            lut: cmd.lut,
            dry_run: cmd.dry_run,
            paused: cmd.pause,
            resumed: false,
            collisions,
        });
        if state.auto_complete {
            state.complete_all();
        }
        state.raise_if_enabled();
        cond.notify_all();
        Ok(())
    }

    fn resume_scan(&mut self, image: &ImageBuffer) -> Result<(), DisplayError> {
        let mut state = lock(&self.cell);
        let held = state.working.filter(|wb| wb.paused && !wb.resumed);
        let Some(mut wb) = held else {
            return Err(DisplayError::BusWriteError);
        };
        if state.fail_next_resume {
            // the held scan never gets released
            state.fail_next_resume = false;
            return Err(DisplayError::BusWriteError);
        }
        wb.resumed = true;
        state.working = Some(wb);
        state.resumes += 1;
        if let Some(last) = state.submissions.last_mut() {
            last.image = Some(image.clone());
        }
        // the working buffer was computed before the pause
        state.finish_working_buffer();
        if state.auto_complete {
            state.complete_all();
        }
        state.raise_if_enabled();
        Ok(())
    }
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.cell)
    }

    /// Let every update finish as soon as it is programmed
    pub fn set_auto_complete(&self, on: bool) {
        let mut state = self.state();
        state.auto_complete = on;
        if on {
            state.complete_all();
            state.raise_if_enabled();
        }
    }

    /// Finish the pending working buffer. A held update stops at its pause
    /// point first. Returns false when nothing was pending.
    pub fn finish_working_buffer(&self) -> bool {
        let mut state = self.state();
        let done = state.finish_working_buffer();
        state.raise_if_enabled();
        done
    }

    pub fn finish_lut(&self, lut: u8) -> bool {
        let mut state = self.state();
        let done = state.finish_lut(lut, false);
        state.raise_if_enabled();
        done
    }

    /// Finish a scan that changed no pixel
    pub fn cancel_lut(&self, lut: u8) -> bool {
        let mut state = self.state();
        let done = state.finish_lut(lut, true);
        state.raise_if_enabled();
        done
    }

    /// Finish the working buffer and every scan in one interrupt
    pub fn complete_all(&self) {
        let mut state = self.state();
        state.complete_all();
        state.raise_if_enabled();
    }

    /// Finish every scanning LUT
    pub fn finish_all_luts(&self) {
        let mut state = self.state();
        for lut in state.finishable() {
            state.finish_lut(lut, false);
        }
        state.raise_if_enabled();
    }

    /// Make the next `program_update` fail with a bus error
    pub fn fail_next_program(&self) {
        self.state().fail_next_program = true;
    }

    /// Make the next `resume_scan` fail with a bus error
    pub fn fail_next_resume(&self) {
        self.state().fail_next_resume = true;
    }

    /// Block until at least `count` updates have been programmed
    pub fn wait_for_programmed(&self, count: usize, timeout: Duration) -> bool {
        let (mutex, cond) = &*self.cell;
        let deadline = Instant::now() + timeout;
        let mut state = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while state.submissions.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn submissions(&self) -> Vec<SubmittedUpdate> {
        self.state().submissions.clone()
    }

    /// LUTs currently driving the panel
    pub fn scanning(&self) -> Vec<u8> {
        self.state().scanning.iter().map(|(lut, _)| *lut).collect()
    }

    pub fn working_buffer_pending(&self) -> bool {
        self.state().working.is_some()
    }

    /// Paused updates released by the engine
    pub fn resumes(&self) -> usize {
        self.state().resumes
    }

    pub fn irq_mask(&self) -> IrqMask {
        self.state().mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epdc::interface::Revision;
    use futures::channel::mpsc;

    fn command(lut: u8, region: Rect, image: &ImageBuffer) -> UpdateCommand<'_> {
        UpdateCommand {
            lut,
            region,
            waveform: PhysicalWaveform {
                mode: 2,
                temperature_range: 4,
            },
            mode: UpdateMode::Partial,
            dry_run: false,
            pause: false,
            source: ScanSource::Image(image),
        }
    }

    #[test]
    fn overlapping_scan_latches_collision() {
        let (mut hw, sim) = SimulatedEpdc::new(Capabilities::new(Revision::V1, 64, 64));
        let (tx, _rx) = mpsc::unbounded();
        hw.attach_irq(IrqLine::new(tx));
        let image = ImageBuffer::with_capacity(0);

        hw.program_update(&command(0, Rect::new(0, 0, 10, 10), &image)).unwrap();
        assert!(sim.finish_working_buffer());
        let status = hw.snapshot_status();
        assert!(status.wb_done && !status.collision);
        hw.acknowledge(&status);

        hw.program_update(&command(1, Rect::new(5, 5, 10, 10), &image)).unwrap();
        sim.finish_working_buffer();
        let status = hw.snapshot_status();
        assert!(status.collision);
        assert_eq!(status.colliding_luts, LutMask::single(0));
        hw.acknowledge(&status);
        assert_eq!(hw.snapshot_status(), StatusBits::default());
        assert_eq!(sim.scanning(), vec![0, 1]);
    }

    #[test]
    fn held_update_pauses_before_working_buffer_done() {
        let (mut hw, sim) = SimulatedEpdc::new(Capabilities::new(Revision::V1, 64, 64));
        let image = ImageBuffer::with_capacity(0);
        let mut cmd = command(0, Rect::new(0, 0, 4, 4), &image);
        cmd.pause = true;
        hw.program_update(&cmd).unwrap();
        sim.finish_working_buffer();
        let status = hw.snapshot_status();
        assert!(status.update_specified && !status.wb_done);
        hw.acknowledge(&status);
        hw.resume_scan(&image).unwrap();
        assert!(hw.snapshot_status().wb_done);
        assert_eq!(sim.resumes(), 1);
    }
}
