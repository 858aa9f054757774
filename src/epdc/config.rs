//! Engine configuration
//!
//! Builder in the style of the HAL driver configs: start from `new()` or
//! `Default` and chain the setters.

use std::time::Duration;

use crate::epdc::power::PowerDownDelay;
use crate::epdc::types::Rotation;

/// How submitted updates reach the hardware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateScheme {
    /// Process on the caller's thread; processing errors are returned from
    /// `submit_update`. No merging.
    Snapshot,
    /// Background submission in arrival order, no merging
    Queue,
    /// Background submission, compatible pending updates merge
    #[default]
    QueueAndMerge,
}

impl UpdateScheme {
    pub fn merges(self) -> bool {
        self == UpdateScheme::QueueAndMerge
    }
}

#[derive(Debug, Clone)]
pub struct EpdcConfig {
    pub rotation: Rotation,
    /// Processing buffers in the pool
    pub buffer_count: usize,
    pub scheme: UpdateScheme,
    pub power_down_delay: PowerDownDelay,
    /// Deadline for a working buffer or LUT interrupt
    pub hardware_timeout: Duration,
    /// Default for waits that take no explicit timeout
    pub wait_timeout: Duration,
    /// Temperature used by the ambient policy, °C
    pub ambient_temperature: i32,
    /// Full screens of framebuffer memory, extra pages back alternate buffers
    pub framebuffer_pages: u32,
    pub framebuffer_phys_base: u64,
}

impl EpdcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    #[must_use]
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    #[must_use]
    pub fn scheme(mut self, scheme: UpdateScheme) -> Self {
        self.scheme = scheme;
        self
    }

    #[must_use]
    pub fn power_down_delay(mut self, delay: PowerDownDelay) -> Self {
        self.power_down_delay = delay;
        self
    }

    #[must_use]
    pub fn hardware_timeout(mut self, timeout: Duration) -> Self {
        self.hardware_timeout = timeout;
        self
    }

    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ambient_temperature(mut self, celsius: i32) -> Self {
        self.ambient_temperature = celsius;
        self
    }

    #[must_use]
    pub fn framebuffer(mut self, pages: u32, phys_base: u64) -> Self {
        self.framebuffer_pages = pages.max(1);
        self.framebuffer_phys_base = phys_base;
        self
    }
}

impl Default for EpdcConfig {
    fn default() -> Self {
        Self {
            rotation: Rotation::Rotate0,
            buffer_count: 2,
            scheme: UpdateScheme::QueueAndMerge,
            power_down_delay: PowerDownDelay::After(Duration::from_millis(1000)),
            hardware_timeout: Duration::from_millis(3000),
            wait_timeout: Duration::from_millis(5000),
            ambient_temperature: 24,
            framebuffer_pages: 2,
            framebuffer_phys_base: 0x8000_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EpdcConfig::new()
            .rotation(Rotation::Rotate270)
            .buffer_count(0)
            .scheme(UpdateScheme::Snapshot)
            .framebuffer(3, 0x1000);
        assert_eq!(config.rotation, Rotation::Rotate270);
        assert_eq!(config.buffer_count, 1);
        assert!(!config.scheme.merges());
        assert_eq!(config.framebuffer_pages, 3);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
    }
}
