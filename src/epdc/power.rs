//! Power sequencing for the panel rails and controller clocks
//!
//! `power_up` brings up the clocks and the display rail and leaves the
//! sequencer in `RisingToOn`. The common-voltage rail is only switched on by
//! `commit_scan`, once the hardware has committed to a real scan, so spurious
//! wake-ups never flicker the panel.

use std::time::Duration;

use anyhow::Context;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::epdc::error::Error;

/// Rail names understood by [`RailControl`]
pub struct Rail;
impl Rail {
    pub const DISPLAY: &'static str = "display";
    pub const VCOM: &'static str = "vcom";
}

/// Clock names understood by [`ClockControl`]
pub struct Clock;
impl Clock {
    pub const AXI: &'static str = "epdc_axi";
    pub const PIX: &'static str = "epdc_pix";
}

pub trait RailControl: Send {
    fn set_rail(&mut self, name: &str, on: bool) -> anyhow::Result<()>;
}

pub trait ClockControl: Send {
    fn enable_clock(&mut self, name: &str) -> anyhow::Result<()>;
    fn disable_clock(&mut self, name: &str) -> anyhow::Result<()>;
}

pub trait TemperatureSensor: Send {
    /// Panel temperature in degrees Celsius
    fn read_temperature(&mut self) -> anyhow::Result<i32>;
}

/// Sensor stand-in reporting a constant
#[derive(Debug, Clone, Copy)]
pub struct FixedTemperature(pub i32);

impl TemperatureSensor for FixedTemperature {
    fn read_temperature(&mut self) -> anyhow::Result<i32> {
        Ok(self.0)
    }
}

/// For boards whose controller clocks are always running
#[derive(Debug, Default)]
pub struct FreeRunningClocks;

impl ClockControl for FreeRunningClocks {
    fn enable_clock(&mut self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn disable_clock(&mut self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Panel rails switched by two GPIOs
pub struct GpioRails<P, D> {
    display: P,
    vcom: P,
    delay: D,
    /// Settling time after switching the display rail
    settle_ms: u32,
}

impl<P, D> GpioRails<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(display: P, vcom: P, delay: D) -> Self {
        Self {
            display,
            vcom,
            delay,
            settle_ms: 2,
        }
    }

    #[must_use]
    pub fn settle_ms(mut self, ms: u32) -> Self {
        self.settle_ms = ms;
        self
    }
}

impl<P, D> RailControl for GpioRails<P, D>
where
    P: OutputPin + Send,
    D: DelayNs + Send,
{
    fn set_rail(&mut self, name: &str, on: bool) -> anyhow::Result<()> {
        let pin = match name {
            Rail::DISPLAY => &mut self.display,
            Rail::VCOM => &mut self.vcom,
            other => anyhow::bail!("unknown rail {}", other),
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        result.map_err(|e| anyhow::anyhow!("rail {} pin error: {:?}", name, e))?;
        if name == Rail::DISPLAY && on {
            self.delay.delay_ms(self.settle_ms);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerState {
    #[default]
    Off,
    RisingToOn,
    On,
}

/// Grace period between going idle and powering down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDownDelay {
    /// Stay powered
    Never,
    Immediate,
    After(Duration),
}

impl PowerDownDelay {
    /// Milliseconds, with a negative value keeping the panel powered
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => PowerDownDelay::Never,
            0 => PowerDownDelay::Immediate,
            ms => PowerDownDelay::After(Duration::from_millis(ms as u64)),
        }
    }
}

/// Owner of the power state; only it transitions it
pub struct PowerSequencer {
    rails: Box<dyn RailControl>,
    clocks: Box<dyn ClockControl>,
    state: PowerState,
    power_ups: u32,
    power_downs: u32,
}

impl PowerSequencer {
    pub fn new(rails: Box<dyn RailControl>, clocks: Box<dyn ClockControl>) -> Self {
        Self {
            rails,
            clocks,
            state: PowerState::Off,
            power_ups: 0,
            power_downs: 0,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Completed power-up sequences
    pub fn power_ups(&self) -> u32 {
        self.power_ups
    }

    /// Completed power-down sequences
    pub fn power_downs(&self) -> u32 {
        self.power_downs
    }

    pub fn power_up(&mut self) -> Result<(), Error> {
        if self.state != PowerState::Off {
            return Ok(());
        }
        log::info!("Powering up panel");
        self.try_power_up().map_err(|e| {
            log::error!("Power up failed: {:#}", e);
            Error::Power(format!("{:#}", e))
        })?;
        self.state = PowerState::RisingToOn;
        self.power_ups += 1;
        Ok(())
    }

    fn try_power_up(&mut self) -> anyhow::Result<()> {
        self.clocks.enable_clock(Clock::AXI)?;
        if let Err(e) = self.clocks.enable_clock(Clock::PIX) {
            self.rollback(&[Clock::AXI]);
            return Err(e);
        }
        if let Err(e) = self
            .rails
            .set_rail(Rail::DISPLAY, true)
            .context("display rail")
        {
            self.rollback(&[Clock::PIX, Clock::AXI]);
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&mut self, clocks: &[&str]) {
        for clock in clocks {
            if let Err(e) = self.clocks.disable_clock(clock) {
                log::warn!("Rollback of clock {} failed: {:#}", clock, e);
            }
        }
    }

    /// The first real scan has begun: enable the common voltage
    pub fn commit_scan(&mut self) -> Result<(), Error> {
        match self.state {
            PowerState::On => Ok(()),
            PowerState::Off => Err(Error::Power("scan committed while powered off".into())),
            PowerState::RisingToOn => {
                self.rails
                    .set_rail(Rail::VCOM, true)
                    .context("vcom rail")
                    .map_err(|e| Error::Power(format!("{:#}", e)))?;
                log::debug!("Panel powered on");
                self.state = PowerState::On;
                Ok(())
            }
        }
    }

    /// Switch everything off; a no-op when already off
    pub fn power_down(&mut self) -> Result<(), Error> {
        if self.state == PowerState::Off {
            return Ok(());
        }
        log::info!("Powering down panel");
        let mut failure = None;
        if self.state == PowerState::On {
            if let Err(e) = self.rails.set_rail(Rail::VCOM, false) {
                failure.get_or_insert(format!("vcom rail: {:#}", e));
            }
        }
        if let Err(e) = self.rails.set_rail(Rail::DISPLAY, false) {
            failure.get_or_insert(format!("display rail: {:#}", e));
        }
        for clock in [Clock::PIX, Clock::AXI] {
            if let Err(e) = self.clocks.disable_clock(clock) {
                failure.get_or_insert(format!("clock {}: {:#}", clock, e));
            }
        }
        self.state = PowerState::Off;
        self.power_downs += 1;
        match failure {
            Some(msg) => {
                log::error!("Power down incomplete: {}", msg);
                Err(Error::Power(msg))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        log: Log,
        fail_on: Option<&'static str>,
    }

    impl RailControl for Recorder {
        fn set_rail(&mut self, name: &str, on: bool) -> anyhow::Result<()> {
            if self.fail_on == Some(name) {
                anyhow::bail!("{} stuck", name);
            }
            self.log.lock().unwrap().push(format!("{}={}", name, on));
            Ok(())
        }
    }

    impl ClockControl for Recorder {
        fn enable_clock(&mut self, name: &str) -> anyhow::Result<()> {
            if self.fail_on == Some(name) {
                anyhow::bail!("{} stuck", name);
            }
            self.log.lock().unwrap().push(format!("+{}", name));
            Ok(())
        }

        fn disable_clock(&mut self, name: &str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("-{}", name));
            Ok(())
        }
    }

    fn sequencer(fail_on: Option<&'static str>) -> (PowerSequencer, Log) {
        let log = Log::default();
        let rails = Recorder {
            log: log.clone(),
            fail_on,
        };
        let clocks = Recorder {
            log: log.clone(),
            fail_on,
        };
        (PowerSequencer::new(Box::new(rails), Box::new(clocks)), log)
    }

    #[test]
    fn full_cycle_order() {
        let (mut power, log) = sequencer(None);
        power.power_up().unwrap();
        assert_eq!(power.state(), PowerState::RisingToOn);
        power.power_up().unwrap();
        power.commit_scan().unwrap();
        assert_eq!(power.state(), PowerState::On);
        power.power_down().unwrap();
        power.power_down().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "+epdc_axi",
                "+epdc_pix",
                "display=true",
                "vcom=true",
                "vcom=false",
                "display=false",
                "-epdc_pix",
                "-epdc_axi"
            ]
        );
        assert_eq!(power.power_downs(), 1);
    }

    #[test]
    fn spurious_wake_never_touches_vcom() {
        let (mut power, log) = sequencer(None);
        power.power_up().unwrap();
        power.power_down().unwrap();
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("vcom")));
    }

    #[test]
    fn failed_rail_rolls_back_clocks() {
        let (mut power, log) = sequencer(Some(Rail::DISPLAY));
        assert!(matches!(power.power_up(), Err(Error::Power(_))));
        assert_eq!(power.state(), PowerState::Off);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["+epdc_axi", "+epdc_pix", "-epdc_pix", "-epdc_axi"]
        );
    }

    #[test]
    fn delay_from_millis() {
        assert_eq!(PowerDownDelay::from_millis(-1), PowerDownDelay::Never);
        assert_eq!(PowerDownDelay::from_millis(0), PowerDownDelay::Immediate);
        assert_eq!(
            PowerDownDelay::from_millis(200),
            PowerDownDelay::After(Duration::from_millis(200))
        );
    }

    #[derive(Default)]
    struct MockPin {
        high: Arc<Mutex<bool>>,
    }

    impl embedded_hal::digital::ErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            *self.high.lock().unwrap() = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            *self.high.lock().unwrap() = true;
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn gpio_rails_drive_pins() {
        let display = MockPin::default();
        let vcom = MockPin::default();
        let (display_level, vcom_level) = (display.high.clone(), vcom.high.clone());
        let mut rails = GpioRails::new(display, vcom, NoDelay).settle_ms(0);
        rails.set_rail(Rail::DISPLAY, true).unwrap();
        assert!(*display_level.lock().unwrap());
        assert!(!*vcom_level.lock().unwrap());
        rails.set_rail(Rail::VCOM, true).unwrap();
        assert!(*vcom_level.lock().unwrap());
        assert!(rails.set_rail("backlight", true).is_err());
    }
}
