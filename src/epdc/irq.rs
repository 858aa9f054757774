//! Interrupt sources, status snapshots and the interrupt line

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;

use crate::epdc::lut::LutMask;

/// Interrupt sources the engine enables or masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqMask {
    /// Working buffer computed and collision check done
    pub wb_done: bool,
    /// Working buffer computed, scan held until released
    pub update_specified: bool,
    /// Per-LUT completion
    pub lut_complete: bool,
}

impl IrqMask {
    /// Regular operation
    pub const NORMAL: IrqMask = IrqMask {
        wb_done: true,
        update_specified: false,
        lut_complete: true,
    };

    /// Pipeline paused for a refinement pass
    pub const PAUSED: IrqMask = IrqMask {
        wb_done: false,
        update_specified: true,
        lut_complete: true,
    };
}

/// Everything the handler needs from the status registers, read in one go.
///
/// Clearing the working-buffer interrupt destroys the collision side-channel,
/// so the whole snapshot is taken before anything is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusBits {
    pub lut_complete: LutMask,
    /// Slots finished without driving a pixel
    pub lut_cancelled: LutMask,
    pub wb_done: bool,
    pub update_specified: bool,
    pub collision: bool,
    pub colliding_luts: LutMask,
}

impl StatusBits {
    pub fn is_empty(&self) -> bool {
        self.lut_complete.is_empty()
            && self.lut_cancelled.is_empty()
            && !self.wb_done
            && !self.update_specified
    }

    /// Slots freed by this snapshot
    pub fn finished_luts(&self) -> LutMask {
        self.lut_complete.union(self.lut_cancelled)
    }
}

pub(crate) enum Wake {
    Kick,
    Shutdown,
}

/// Handle the controller uses to raise its interrupt.
///
/// `raise` is the non-blocking top half: it latches the line and wakes the
/// handler thread, which reads and acknowledges the status registers.
#[derive(Clone)]
pub struct IrqLine {
    pending: Arc<AtomicBool>,
    wake: UnboundedSender<Wake>,
}

impl IrqLine {
    pub(crate) fn new(wake: UnboundedSender<Wake>) -> Self {
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            wake,
        }
    }

    pub fn raise(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            // receiver gone means the engine is shutting down
            let _ = self.wake.unbounded_send(Wake::Kick);
        }
    }

    /// Consume the latched line
    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    #[test]
    fn raise_latches_once() {
        let (tx, mut rx) = mpsc::unbounded();
        let line = IrqLine::new(tx);
        line.raise();
        line.raise();
        assert!(matches!(rx.try_next(), Ok(Some(Wake::Kick))));
        assert!(rx.try_next().is_err());
        assert!(line.take());
        assert!(!line.take());
        line.raise();
        assert!(matches!(rx.try_next(), Ok(Some(Wake::Kick))));
    }

    #[test]
    fn cancelled_luts_count_as_finished() {
        let status = StatusBits {
            lut_complete: LutMask::single(1),
            lut_cancelled: LutMask::single(4),
            ..Default::default()
        };
        assert!(!status.is_empty());
        assert_eq!(status.finished_luts().iter().collect::<Vec<_>>(), vec![1, 4]);
    }
}
