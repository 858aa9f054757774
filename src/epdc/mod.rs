//! Update scheduler for electrophoretic display controllers
//!
//! Sits between an application drawing into a framebuffer and a controller
//! with a bank of hardware LUTs that scan regions of the panel concurrently.
//!
//! This engine is loosely modeled after the update queues of the i.MX EPDC
//! framebuffer driver, with the register access moved behind
//! [`interface::EpdcHardware`].
//!
//!
//! ### Usage
//! Updates are submitted by region and run in the background. To show
//! something you:
//!
//! 1. draw into [`driver::Epdc::framebuffer`], preferably with
//! [`embedded_graphics`](https://github.com/embedded-graphics/embedded-graphics)
//! 1. drop the framebuffer guard and call [`driver::Epdc::submit_update`]
//! with a marker id
//! 1. wait on the returned [`marker::Marker`], or use
//! [`driver::Epdc::flush_all`] before blanking or suspending
//!
//! The panel powers itself up on the first submission and back down once the
//! queues have been idle for the configured grace period.
//!
//!

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod flag;
pub mod interface;
pub mod irq;
pub mod lut;
pub mod marker;
pub mod power;
pub mod pxp;
pub mod refine;
pub mod types;
pub mod waveform;

mod merge;

/// Lock ignoring poison. Every queue transition completes under one guard.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
