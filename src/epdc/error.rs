//! Error taxonomy of the update engine
//!
//! Validation errors are returned from `submit_update` before any resource is
//! taken. Hardware timeouts and processing failures reach the caller through
//! the marker of the affected update. Running out of buffers or LUTs and
//! transient collisions are scheduling states, never errors.

pub use display_interface::DisplayError;

use crate::epdc::types::Rect;

#[derive(Debug, Clone)]
pub enum Error {
    /// Region is empty or reaches past the panel
    InvalidRegion { region: Rect, width: u32, height: u32 },
    /// Raw update mode is neither partial nor full
    InvalidUpdateMode(u32),
    /// Raw waveform number is unknown
    InvalidWaveform(u32),
    /// Display is blanked and takes no updates
    Blanked,
    /// Alternate-buffer flag without a buffer description
    AltBufferMissing,
    /// Alternate buffer outside the framebuffer memory
    AltBufferOutOfRange { phys_addr: u64 },
    /// Alternate source region does not match the update region
    AltRegionMismatch { source: Rect, target: Rect },
    /// Interrupt for the update never arrived
    HardwareTimeout { lut: Option<u8> },
    ImageProcessing(String),
    Interface(DisplayError),
    Power(String),
    WaveformTable(String),
    /// Waiting on a marker or a flush expired
    Timeout,
    /// Engine was dropped before the update finished
    ShutDown,
}

impl Error {
    /// Synchronous rejections made before anything was queued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidRegion { .. }
                | Error::InvalidUpdateMode(_)
                | Error::InvalidWaveform(_)
                | Error::Blanked
                | Error::AltBufferMissing
                | Error::AltBufferOutOfRange { .. }
                | Error::AltRegionMismatch { .. }
        )
    }
}

impl From<DisplayError> for Error {
    fn from(e: DisplayError) -> Self {
        Error::Interface(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidRegion {
                region,
                width,
                height,
            } => write!(f, "region {} outside {}x{} panel", region, width, height),
            Error::InvalidUpdateMode(raw) => write!(f, "invalid update mode {}", raw),
            Error::InvalidWaveform(raw) => write!(f, "invalid waveform mode {}", raw),
            Error::Blanked => write!(f, "display is blanked"),
            Error::AltBufferMissing => write!(f, "alternate buffer flag set without a buffer"),
            Error::AltBufferOutOfRange { phys_addr } => {
                write!(f, "alternate buffer 0x{:08X} outside framebuffer", phys_addr)
            }
            Error::AltRegionMismatch { source, target } => write!(
                f,
                "alternate region {} does not match update region {}",
                source, target
            ),
            Error::HardwareTimeout { lut: Some(lut) } => {
                write!(f, "hardware timeout on LUT {}", lut)
            }
            Error::HardwareTimeout { lut: None } => write!(f, "hardware timeout"),
            Error::ImageProcessing(msg) => write!(f, "image processing failed: {}", msg),
            Error::Interface(e) => write!(f, "controller interface error: {:?}", e),
            Error::Power(msg) => write!(f, "power sequencing failed: {}", msg),
            Error::WaveformTable(msg) => write!(f, "bad waveform table: {}", msg),
            Error::Timeout => write!(f, "timed out"),
            Error::ShutDown => write!(f, "update engine shut down"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_classification() {
        assert!(Error::Blanked.is_validation());
        assert!(Error::InvalidUpdateMode(3).is_validation());
        assert!(!Error::HardwareTimeout { lut: Some(2) }.is_validation());
        assert!(!Error::Timeout.is_validation());
    }

    #[test]
    fn converts_into_anyhow() {
        let e: anyhow::Error = Error::HardwareTimeout { lut: Some(4) }.into();
        assert_eq!(e.to_string(), "hardware timeout on LUT 4");
    }
}
