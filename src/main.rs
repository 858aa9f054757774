use std::time::Duration;

use embedded_graphics::mono_font::iso_8859_15::FONT_5X8;
// https://docs.rs/embedded-graphics/0.8.1/embedded_graphics/mono_font/index.html#modules
use embedded_graphics::mono_font::{iso_8859_15::FONT_10X20 as ISO15_10, MonoTextStyle};
use embedded_graphics::pixelcolor::Gray8;
use embedded_graphics::{prelude::*, text::Text};

#[cfg(not(target_os = "espidf"))]
use epdc_scheduler::epdc::power::RailControl;
use epdc_scheduler::epdc::power::FreeRunningClocks;
use epdc_scheduler::sim::SimulatedEpdc;
use epdc_scheduler::{
    Capabilities, Collaborators, Epdc, EpdcConfig, Flag, PowerDownDelay, Rect, Revision,
    UpdateFlags, UpdateMode, UpdateRequest, WaveformMode,
};

/// Panel width, pixels horizontally
const WIDTH: u32 = 800;

/// Panel height, pixels vertically
const HEIGHT: u32 = 600;

// Splash screen converted to 8-bit grey at build time, empty when splash.png was missing
const SPLASH_IMAGE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/splash.bin"));

/// Rails of a board without switchable panel supplies
#[cfg(not(target_os = "espidf"))]
struct ConsoleRails;

#[cfg(not(target_os = "espidf"))]
impl RailControl for ConsoleRails {
    fn set_rail(&mut self, name: &str, on: bool) -> anyhow::Result<()> {
        println!("rail {} {}", name, if on { "on" } else { "off" });
        Ok(())
    }
}

#[cfg(not(target_os = "espidf"))]
fn collaborators() -> anyhow::Result<Collaborators> {
    Ok(Collaborators::new(ConsoleRails, FreeRunningClocks))
}

// https://docs.esp-rs.org/esp-idf-svc/esp_idf_svc/
#[cfg(target_os = "espidf")]
fn collaborators() -> anyhow::Result<Collaborators> {
    use esp_idf_svc::hal::delay::FreeRtos;
    use esp_idf_svc::hal::gpio::{OutputPin, PinDriver};
    use esp_idf_svc::hal::peripherals::Peripherals;
    use epdc_scheduler::epdc::power::GpioRails;

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    // Display rail on pin 7 as on the WeAct boards, common voltage on pin 6
    let display = PinDriver::output(pins.gpio7.downgrade_output())?;
    let vcom = PinDriver::output(pins.gpio6.downgrade_output())?;
    let rails = GpioRails::new(display, vcom, FreeRtos).settle_ms(100);

    Ok(Collaborators::new(rails, FreeRunningClocks))
}

/// Console backend for the log crate on the host, where there is no ESP logger
#[cfg(not(target_os = "espidf"))]
struct ConsoleLogger;

#[cfg(not(target_os = "espidf"))]
impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("{:<5} {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

#[cfg(not(target_os = "espidf"))]
static LOGGER: ConsoleLogger = ConsoleLogger;

fn to_rect(area: embedded_graphics::primitives::Rectangle) -> Rect {
    Rect::new(
        area.top_left.x.max(0) as u32,
        area.top_left.y.max(0) as u32,
        area.size.width,
        area.size.height,
    )
}

fn show_splash<H>(epdc: &Epdc<H>) -> anyhow::Result<()>
where
    H: epdc_scheduler::EpdcHardware + 'static,
{
    if SPLASH_IMAGE.is_empty() {
        log::warn!("Splash image not available (splash.png not found at build time)");
        return Ok(());
    }
    {
        let mut fb = epdc.framebuffer();
        let visible = (WIDTH * HEIGHT) as usize;
        let len = SPLASH_IMAGE.len().min(visible);
        fb.memory_mut()[..len].copy_from_slice(&SPLASH_IMAGE[..len]);
    }
    let request = UpdateRequest::new(Rect::new(0, 0, WIDTH, HEIGHT), WaveformMode::FullGrey, UpdateMode::Full)
        .marker(1);
    if let Some(marker) = epdc.submit_update(request)? {
        epdc.wait_for_completion(&marker, epdc.wait_timeout())?;
    }
    log::info!("Splash displayed");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    #[cfg(target_os = "espidf")]
    {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        // Bind the log crate to the ESP Logging facilities
        esp_idf_svc::log::EspLogger::initialize_default();
    }
    #[cfg(not(target_os = "espidf"))]
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Debug))
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    // No EPDC on this board, the controller is simulated and finishes every update at once
    let (hw, sim) = SimulatedEpdc::new(Capabilities::new(Revision::V2, WIDTH, HEIGHT));
    sim.set_auto_complete(true);

    let config = EpdcConfig::new().power_down_delay(PowerDownDelay::from_millis(200));
    let epdc = Epdc::new(hw, collaborators()?, config)?;

    show_splash(&epdc)?;

    // Label and title in two separate regions, submitted back to back
    let label_style = MonoTextStyle::new(&FONT_5X8, Gray8::BLACK);
    let title_style = MonoTextStyle::new(&ISO15_10, Gray8::new(0x55));
    let (label_area, title_area) = {
        let mut fb = epdc.framebuffer();
        let label = Text::new("Update scheduler", Point::new(10, 10), label_style);
        let title = Text::new("Hello e-paper", Point::new(10, 30), title_style);
        label.draw(&mut *fb)?;
        title.draw(&mut *fb)?;
        (label.bounding_box(), title.bounding_box())
    };

    let mut markers = Vec::new();
    for (id, area, waveform) in [
        (2, label_area, WaveformMode::Auto),
        (3, title_area, WaveformMode::Auto),
    ] {
        let request = UpdateRequest::new(to_rect(area), waveform, UpdateMode::Partial).marker(id);
        if let Some(marker) = epdc.submit_update(request)? {
            markers.push(marker);
        }
    }

    // Probe whether a full-screen flash would collide with anything still scanning
    let probe = UpdateRequest::new(Rect::new(0, 0, WIDTH, HEIGHT), WaveformMode::FastFlash, UpdateMode::Full)
        .flags(UpdateFlags::new().with(Flag::TEST_COLLISION))
        .marker(4);
    if let Some(marker) = epdc.submit_update(probe)? {
        markers.push(marker);
    }

    for marker in &markers {
        let outcome = epdc.wait_for_completion(marker, epdc.wait_timeout())?;
        log::info!(
            "Marker {} complete, collision detected: {}",
            marker.id(),
            outcome.collision_detected
        );
    }

    epdc.flush_all(Duration::from_secs(5))?;
    let snapshot = epdc.snapshot();
    log::info!(
        "{} updates, {} merged, {} sent to the controller",
        snapshot.stats.submitted, snapshot.stats.merged, snapshot.stats.hardware_submissions
    );
    for update in sim.submissions() {
        log::info!(
            "  LUT {} {} waveform {}{}",
            update.lut,
            update.region,
            update.waveform.mode,
            if update.dry_run { " (dry run)" } else { "" }
        );
    }

    // Give the power-down grace period time to run out
    std::thread::sleep(Duration::from_millis(300));
    log::info!("Panel power: {:?}", epdc.power_state());
    Ok(())
}
