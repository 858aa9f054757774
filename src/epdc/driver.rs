//! Update engine
//!
//! Accepts update requests, runs them through the image processor, binds them
//! to hardware LUTs and follows every update to completion.
//!
//! ## Threads
//!
//! - caller threads: `submit_update`, waits, flushes and settings
//! - submission worker: turns pending updates and cleared collisions into
//!   hardware submissions
//! - interrupt thread: woken through [`IrqLine`], snapshots and acknowledges
//!   the status registers, then applies the snapshot
//! - timer thread: power-down grace period and the hardware watchdog
//!
//! ## Locking
//!
//! The processor gate is taken before the queue lock, the queue lock before
//! the power lock. Marker, sensor, framebuffer and timer locks are leaves.
//! Nothing waits on the image processor, a marker or a timer while holding
//! the queue lock.
//!
//! ## Buffer life cycle
//!
//! Every processing buffer lives in exactly one of: free list, processing
//! slot, queue, collision list, in-flight slot.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::executor::block_on;
use futures::StreamExt;

use crate::epdc::buffer::{allocate_pool, range_holds, Framebuffer, ImageBuffer, ProcBuffer};
use crate::epdc::config::{EpdcConfig, UpdateScheme};
use crate::epdc::error::Error;
use crate::epdc::flag::Flag;
use crate::epdc::interface::{Capabilities, EpdcHardware, ScanSource, UpdateCommand};
use crate::epdc::irq::{IrqLine, IrqMask, StatusBits, Wake};
use crate::epdc::lock;
use crate::epdc::lut::{LutMask, LutTable};
use crate::epdc::marker::{Marker, MarkerKey, MarkerRegistry};
use crate::epdc::merge::{merge, MergeRefusal};
use crate::epdc::power::{
    ClockControl, FixedTemperature, PowerDownDelay, PowerSequencer, PowerState, RailControl,
    TemperatureSensor,
};
use crate::epdc::pxp::{
    FrameSource, Histogram, ImageProcessor, JobCompletion, ProcessJob, SoftwareProcessor,
    TransformFlags,
};
use crate::epdc::refine;
use crate::epdc::types::{Rect, Rotation, TemperaturePolicy, UpdateOutcome, UpdateRequest, WaveformMode};
use crate::epdc::waveform::WaveformTable;

/// A queued request plus its scheduling state
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateDesc {
    pub(crate) request: UpdateRequest,
    /// Request region mapped onto the panel
    pub(crate) panel_region: Rect,
    /// Processing order; merges keep the newest
    pub(crate) order: u64,
    pub(crate) markers: Vec<MarkerKey>,
}

impl UpdateDesc {
    pub(crate) fn new(
        request: UpdateRequest,
        panel_region: Rect,
        order: u64,
        markers: Vec<MarkerKey>,
    ) -> Self {
        Self {
            request,
            panel_region,
            order,
            markers,
        }
    }

    pub(crate) fn is_high_fidelity(&self) -> bool {
        self.request.waveform.is_refined()
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.request.flags.is_dry_run()
    }

    /// Hold the scan for a refinement pass
    pub(crate) fn needs_pause(&self) -> bool {
        !self.is_dry_run()
            && (self.is_high_fidelity() || self.request.flags.is_set(Flag::USE_DITHERING))
    }
}

/// Counters of scheduling events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Requests accepted by `submit_update`
    pub submitted: u64,
    pub hardware_submissions: u64,
    /// Updates folded into another one
    pub merged: u64,
    pub collisions: u64,
    /// Collided updates sent to the hardware again
    pub resubmissions: u64,
    /// Collided updates dropped because newer work covered them
    pub moot_drops: u64,
    pub dry_runs: u64,
    pub cancelled_luts: u64,
    pub timeouts: u64,
    /// Times pending work waited for a free buffer
    pub buffer_waits: u64,
    /// Times a processed update waited for a free LUT
    pub lut_waits: u64,
    pub failures: u64,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pool: usize,
    pub free: usize,
    pub processing: usize,
    pub queued: usize,
    pub colliding: usize,
    /// 0 or 1: the update whose working buffer is being computed
    pub submitted: usize,
    /// Descriptors not yet bound to a buffer
    pub pending: usize,
    pub active_luts: LutMask,
    pub leaked_luts: LutMask,
    /// Active LUTs with the processing order of their owner
    pub lut_owners: Vec<(u8, u64)>,
    /// Unresolved markers with the LUTs they wait on
    pub markers: Vec<(u32, LutMask)>,
    pub power: PowerState,
    pub power_ups: u32,
    pub power_downs: u32,
    pub blanked: bool,
    pub stats: EngineStats,
}

impl QueueSnapshot {
    /// Every buffer is in exactly one list
    pub fn buffers_accounted(&self) -> bool {
        self.free + self.processing + self.queued + self.colliding + self.submitted == self.pool
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.free == self.pool && self.active_luts.is_empty()
    }
}

/// External collaborators the engine drives
pub struct Collaborators {
    pub rails: Box<dyn RailControl>,
    pub clocks: Box<dyn ClockControl>,
    pub sensor: Box<dyn TemperatureSensor>,
    pub processor: Box<dyn ImageProcessor>,
    pub waveforms: WaveformTable,
}

impl Collaborators {
    /// Software image processor, built-in waveform table and a fixed 24 °C
    /// sensor unless replaced
    pub fn new(rails: impl RailControl + 'static, clocks: impl ClockControl + 'static) -> Self {
        Self {
            rails: Box::new(rails),
            clocks: Box::new(clocks),
            sensor: Box::new(FixedTemperature(24)),
            processor: Box::new(SoftwareProcessor::new()),
            waveforms: WaveformTable::builtin(),
        }
    }

    #[must_use]
    pub fn sensor(mut self, sensor: impl TemperatureSensor + 'static) -> Self {
        self.sensor = Box::new(sensor);
        self
    }

    #[must_use]
    pub fn processor(mut self, processor: impl ImageProcessor + 'static) -> Self {
        self.processor = Box::new(processor);
        self
    }

    #[must_use]
    pub fn waveforms(mut self, waveforms: WaveformTable) -> Self {
        self.waveforms = waveforms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WbStage {
    Computing,
    /// Computed, scan held until the refinement pass releases it
    AwaitingRefine,
    Refined,
}

struct InFlight {
    buf: ProcBuffer,
    stage: WbStage,
    deadline: Instant,
    /// Own LUT finished without driving a pixel
    cancelled: bool,
}

struct Queues<H> {
    hw: H,
    pending: VecDeque<UpdateDesc>,
    free: Vec<ProcBuffer>,
    processing: Option<ProcBuffer>,
    queued: VecDeque<ProcBuffer>,
    collisions: Vec<ProcBuffer>,
    current: Option<InFlight>,
    luts: LutTable,
    /// LUTs completed since the in-flight working buffer started
    luts_complete_wb: LutMask,
    markers: MarkerRegistry,
    order: u64,
    scheme: UpdateScheme,
    power_down_delay: PowerDownDelay,
    power_down_at: Option<Instant>,
    blanked: bool,
    ambient: i32,
    stats: EngineStats,
    pool: usize,
}

impl<H> Queues<H> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.processing.is_none()
            && self.queued.is_empty()
            && self.collisions.is_empty()
            && self.current.is_none()
            && self.luts.active().is_empty()
    }

    fn work_ready(&self) -> bool {
        self.collisions.iter().any(|b| b.collision_mask.is_empty())
            || (!self.pending.is_empty() && !self.free.is_empty())
    }

    fn release_buffer(&mut self, mut buf: ProcBuffer) {
        buf.recycle();
        self.free.push(buf);
    }

    /// Forget a stuck LUT for good
    fn leak_lut(&mut self, lut: u8) {
        self.luts.leak(lut);
        for buf in self.collisions.iter_mut() {
            buf.collision_mask.remove(lut);
        }
    }
}

struct PxpState {
    processor: Box<dyn ImageProcessor>,
}

#[derive(Default)]
struct TimerState {
    seq: u64,
    shutdown: bool,
}

struct Shared<H> {
    caps: Capabilities,
    rotation: Rotation,
    /// Caller-space size
    width: u32,
    height: u32,
    fb_phys: Range<u64>,
    buffer_capacity: usize,
    hardware_timeout: Duration,
    wait_timeout: Duration,
    waveforms: WaveformTable,
    framebuffer: Arc<RwLock<Framebuffer>>,
    pxp: Mutex<PxpState>,
    queues: Mutex<Queues<H>>,
    idle: Condvar,
    power: Mutex<PowerSequencer>,
    sensor: Mutex<Box<dyn TemperatureSensor>>,
    timer: Mutex<TimerState>,
    timer_cond: Condvar,
    irq: IrqLine,
    submit_tx: UnboundedSender<Wake>,
}

/// Update engine for one controller
pub struct Epdc<H: EpdcHardware + 'static> {
    shared: Arc<Shared<H>>,
    irq_tx: UnboundedSender<Wake>,
    threads: Vec<JoinHandle<()>>,
}

impl<H: EpdcHardware + 'static> Epdc<H> {
    pub fn new(mut hw: H, collaborators: Collaborators, config: EpdcConfig) -> anyhow::Result<Self> {
        let caps = hw.capabilities();
        let (width, height) = if config.rotation.is_transposed() {
            (caps.panel_height, caps.panel_width)
        } else {
            (caps.panel_width, caps.panel_height)
        };
        log::info!(
            "EPDC {} with {} LUTs, panel {}x{}, {:?}, {} buffers, {:?}",
            caps.revision.name,
            caps.lut_count(),
            caps.panel_width,
            caps.panel_height,
            config.rotation,
            config.buffer_count,
            config.scheme
        );

        let (submit_tx, submit_rx) = mpsc::unbounded();
        let (irq_tx, irq_rx) = mpsc::unbounded();
        let irq = IrqLine::new(irq_tx.clone());
        hw.attach_irq(irq.clone());
        hw.set_irq_mask(IrqMask::NORMAL);

        let framebuffer = Framebuffer::new(
            width,
            height,
            config.framebuffer_pages,
            config.framebuffer_phys_base,
        );
        let fb_phys = framebuffer.phys_range();
        let buffer_capacity = caps.panel_width as usize * caps.panel_height as usize;
        let pool = config.buffer_count.max(1);
        let queues = Queues {
            hw,
            pending: VecDeque::new(),
            free: allocate_pool(pool, buffer_capacity),
            processing: None,
            queued: VecDeque::new(),
            collisions: Vec::new(),
            current: None,
            luts: LutTable::new(caps.lut_count(), caps.revision.lut_hazard),
            luts_complete_wb: LutMask::EMPTY,
            markers: MarkerRegistry::new(),
            order: 0,
            scheme: config.scheme,
            power_down_delay: config.power_down_delay,
            power_down_at: None,
            blanked: false,
            ambient: config.ambient_temperature,
            stats: EngineStats::default(),
            pool,
        };

        let shared = Arc::new(Shared {
            caps,
            rotation: config.rotation,
            width,
            height,
            fb_phys,
            buffer_capacity,
            hardware_timeout: config.hardware_timeout,
            wait_timeout: config.wait_timeout,
            waveforms: collaborators.waveforms,
            framebuffer: Arc::new(RwLock::new(framebuffer)),
            pxp: Mutex::new(PxpState {
                processor: collaborators.processor,
            }),
            queues: Mutex::new(queues),
            idle: Condvar::new(),
            power: Mutex::new(PowerSequencer::new(collaborators.rails, collaborators.clocks)),
            sensor: Mutex::new(collaborators.sensor),
            timer: Mutex::new(TimerState::default()),
            timer_cond: Condvar::new(),
            irq,
            submit_tx,
        });

        let mut engine = Epdc {
            shared,
            irq_tx,
            threads: Vec::new(),
        };
        // on error the partially started engine is dropped, which stops the
        // threads already running
        let s = engine.shared.clone();
        engine.threads.push(
            thread::Builder::new()
                .name("epdc-submit".into())
                .spawn(move || submission_worker(s, submit_rx))
                .context("spawning submission worker")?,
        );
        let s = engine.shared.clone();
        engine.threads.push(
            thread::Builder::new()
                .name("epdc-irq".into())
                .spawn(move || irq_thread(s, irq_rx))
                .context("spawning interrupt thread")?,
        );
        let s = engine.shared.clone();
        engine.threads.push(
            thread::Builder::new()
                .name("epdc-timer".into())
                .spawn(move || timer_thread(s))
                .context("spawning timer thread")?,
        );
        Ok(engine)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.caps
    }

    /// Size of the caller's coordinate space
    pub fn size(&self) -> (u32, u32) {
        (self.shared.width, self.shared.height)
    }

    /// Default timeout for waits, from the configuration
    pub fn wait_timeout(&self) -> Duration {
        self.shared.wait_timeout
    }

    /// Queue an update.
    ///
    /// Bad requests are rejected before anything is allocated. Returns the
    /// marker when the request carries a marker id. In the snapshot scheme the
    /// update is processed before returning and processing errors are
    /// returned here as well as through the marker.
    pub fn submit_update(&self, request: UpdateRequest) -> Result<Option<Marker>, Error> {
        let panel_region = self.validate(&request)?;
        let mut request = request;
        if !request.flags.is_set(Flag::USE_ALT_BUFFER) {
            request.alt_buffer = None;
        }

        let shared = &*self.shared;
        let (desc, marker) = {
            let mut q = lock(&shared.queues);
            if q.blanked {
                return Err(Error::Blanked);
            }
            q.order += 1;
            let order = q.order;
            let (keys, marker) = match request.marker {
                Some(id) => {
                    let (key, marker) = q.markers.register(id);
                    (vec![key], Some(marker))
                }
                None => (Vec::new(), None),
            };
            q.power_down_at = None;
            q.stats.submitted += 1;
            log::debug!(
                "Update {}: {} {} {:?} flags 0x{:02X}",
                order,
                request.region,
                request.waveform,
                request.mode,
                request.flags.bits
            );
            let desc = UpdateDesc::new(request, panel_region, order, keys);
            if q.scheme != UpdateScheme::Snapshot {
                q.pending.push_back(desc);
                drop(q);
                kick_submission(shared);
                return Ok(marker);
            }
            (desc, marker)
        };

        if !submit_work(shared, Some(desc))? {
            // no free buffer, the descriptor went to the pending queue
            kick_submission(shared);
        }
        Ok(marker)
    }

    fn validate(&self, request: &UpdateRequest) -> Result<Rect, Error> {
        let shared = &*self.shared;
        let (width, height) = (shared.width, shared.height);
        let region = request.region;
        if region.is_empty() || !fits(&region, width, height) {
            log::warn!("Rejecting update {} outside {}x{}", region, width, height);
            return Err(Error::InvalidRegion {
                region,
                width,
                height,
            });
        }
        if request.flags.is_set(Flag::USE_ALT_BUFFER) {
            let alt = request.alt_buffer.ok_or(Error::AltBufferMissing)?;
            if !range_holds(&shared.fb_phys, &alt) {
                return Err(Error::AltBufferOutOfRange {
                    phys_addr: alt.phys_addr,
                });
            }
            let source = alt.region;
            if !fits(&source, alt.width, alt.height)
                || source.width != region.width
                || source.height != region.height
            {
                return Err(Error::AltRegionMismatch {
                    source,
                    target: region,
                });
            }
        }
        Ok(region.to_panel(
            shared.rotation,
            shared.caps.panel_width,
            shared.caps.panel_height,
        ))
    }

    pub fn wait_for_submission(&self, marker: &Marker, timeout: Duration) -> Result<(), Error> {
        marker.wait_submitted(timeout)
    }

    /// Block until the update is visible. Expiry is a hard error.
    pub fn wait_for_completion(
        &self,
        marker: &Marker,
        timeout: Duration,
    ) -> Result<UpdateOutcome, Error> {
        marker.wait_complete(timeout).inspect_err(|e| {
            if matches!(e, Error::Timeout) {
                log::error!("Marker {} not complete after {:?}", marker.id(), timeout);
            }
        })
    }

    /// Block until nothing is pending, processing, queued, colliding or
    /// scanning
    pub fn flush_all(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut q = lock(&self.shared.queues);
        while !q.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                log::error!(
                    "Flush timed out: {} pending, {} queued, {} colliding, LUTs {:?}",
                    q.pending.len(),
                    q.queued.len(),
                    q.collisions.len(),
                    q.luts.active()
                );
                return Err(Error::Timeout);
            }
            q = self
                .shared
                .idle
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }

    /// Change the power-down grace period. A pending power-down is re-armed
    /// from now.
    pub fn set_power_down_delay(&self, delay: PowerDownDelay) {
        let shared = &*self.shared;
        let mut q = lock(&shared.queues);
        log::info!("Power down delay {:?}", delay);
        q.power_down_delay = delay;
        q.power_down_at = None;
        if q.is_idle() {
            schedule_power_down(shared, &mut q);
        }
    }

    /// While blanked every submission is rejected
    pub fn blank(&self, on: bool) {
        let shared = &*self.shared;
        let mut q = lock(&shared.queues);
        log::info!("Display {}", if on { "blanked" } else { "unblanked" });
        q.blanked = on;
        if on && q.is_idle() {
            q.power_down_at = None;
            power_down_now(shared);
        }
    }

    /// Temperature for updates using the ambient policy
    pub fn set_temperature(&self, celsius: i32) {
        lock(&self.shared.queues).ambient = celsius;
    }

    pub fn set_update_scheme(&self, scheme: UpdateScheme) {
        lock(&self.shared.queues).scheme = scheme;
    }

    /// Draw access to the framebuffer.
    ///
    /// Drop the guard before submitting: processing reads the framebuffer.
    pub fn framebuffer(&self) -> RwLockWriteGuard<'_, Framebuffer> {
        self.shared
            .framebuffer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn power_state(&self) -> PowerState {
        lock(&self.shared.power).state()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let q = lock(&self.shared.queues);
        let power = lock(&self.shared.power);
        let active = q.luts.active();
        QueueSnapshot {
            pool: q.pool,
            free: q.free.len(),
            processing: usize::from(q.processing.is_some()),
            queued: q.queued.len(),
            colliding: q.collisions.len(),
            submitted: usize::from(q.current.is_some()),
            pending: q.pending.len(),
            active_luts: active,
            leaked_luts: q.luts.leaked(),
            lut_owners: active.iter().map(|lut| (lut, q.luts.owner_order(lut))).collect(),
            markers: q.markers.dependencies(),
            power: power.state(),
            power_ups: power.power_ups(),
            power_downs: power.power_downs(),
            blanked: q.blanked,
            stats: q.stats,
        }
    }
}

impl<H: EpdcHardware + 'static> Drop for Epdc<H> {
    fn drop(&mut self) {
        let shared = &*self.shared;
        // receivers may already be gone
        let _ = shared.submit_tx.unbounded_send(Wake::Shutdown);
        let _ = self.irq_tx.unbounded_send(Wake::Shutdown);
        {
            let mut timer = lock(&shared.timer);
            timer.shutdown = true;
            shared.timer_cond.notify_all();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("EPDC thread panicked");
            }
        }

        let mut q = lock(&shared.queues);
        q.markers.fail_all(Error::ShutDown);
        power_down_now(shared);
        log::info!("EPDC shut down after {} updates", q.stats.submitted);
    }
}

fn fits(region: &Rect, width: u32, height: u32) -> bool {
    region.left.checked_add(region.width).is_some_and(|r| r <= width)
        && region.top.checked_add(region.height).is_some_and(|b| b <= height)
}

fn kick_submission<H>(shared: &Shared<H>) {
    // the worker is gone only while shutting down
    let _ = shared.submit_tx.unbounded_send(Wake::Kick);
}

fn kick_timer<H>(shared: &Shared<H>) {
    let mut timer = lock(&shared.timer);
    timer.seq += 1;
    shared.timer_cond.notify_all();
}

fn power_down_now<H>(shared: &Shared<H>) {
    if let Err(e) = lock(&shared.power).power_down() {
        log::error!("Power down failed: {}", e);
    }
}

fn schedule_power_down<H>(shared: &Shared<H>, q: &mut Queues<H>) {
    match q.power_down_delay {
        PowerDownDelay::Never => q.power_down_at = None,
        PowerDownDelay::Immediate => {
            q.power_down_at = None;
            power_down_now(shared);
        }
        PowerDownDelay::After(delay) => {
            if q.power_down_at.is_none() && lock(&shared.power).state() != PowerState::Off {
                log::debug!("Powering down in {:?}", delay);
                q.power_down_at = Some(Instant::now() + delay);
                kick_timer(shared);
            }
        }
    }
}

/// Follow-up after any change of queue state: start queued work, wake the
/// worker, and on idle release flush waiters and schedule the power-down
fn settle<H: EpdcHardware>(shared: &Shared<H>, q: &mut Queues<H>) {
    while q.current.is_none() && !q.queued.is_empty() && q.luts.available() {
        let Some(buf) = q.queued.pop_front() else {
            break;
        };
        if let Err(e) = start_update(shared, q, buf) {
            log::error!("Starting queued update failed: {}", e);
        }
    }
    if q.work_ready() {
        kick_submission(shared);
    }
    if q.is_idle() {
        shared.idle.notify_all();
        schedule_power_down(shared, q);
    }
}

fn downgrade(desc: &mut UpdateDesc) {
    if !desc.is_high_fidelity() {
        desc.request.waveform = WaveformMode::Auto;
    }
}

/// Pick the next unit of work: a direct snapshot descriptor, a cleared
/// collision, or the head of the pending queue
fn take_work<H>(
    q: &mut Queues<H>,
    max_width: u32,
    direct: Option<UpdateDesc>,
) -> Option<(ProcBuffer, UpdateDesc)> {
    if let Some(desc) = direct {
        return match q.free.pop() {
            Some(buf) => Some((buf, desc)),
            None => {
                q.stats.buffer_waits += 1;
                q.pending.push_back(desc);
                None
            }
        };
    }

    if let Some(pos) = q.collisions.iter().position(|b| b.collision_mask.is_empty()) {
        let mut buf = q.collisions.remove(pos);
        let Some(mut desc) = buf.recycle() else {
            q.release_buffer(buf);
            return None;
        };
        downgrade(&mut desc);
        if q.scheme.merges() {
            let mut i = 0;
            while i < q.collisions.len() {
                if !q.collisions[i].collision_mask.is_empty() {
                    i += 1;
                    continue;
                }
                let Some(mut other) = q.collisions[i].desc.clone() else {
                    i += 1;
                    continue;
                };
                // the sibling stays untouched unless the merge goes through
                downgrade(&mut other);
                if merge(&mut desc, &mut other, max_width).is_ok() {
                    let merged = q.collisions.remove(i);
                    q.release_buffer(merged);
                    q.stats.merged += 1;
                } else {
                    i += 1;
                }
            }
        }
        log::debug!("Resubmitting collided update {}", desc.order);
        q.stats.resubmissions += 1;
        return Some((buf, desc));
    }

    if q.pending.is_empty() {
        return None;
    }
    if q.free.is_empty() {
        q.stats.buffer_waits += 1;
        return None;
    }
    let mut desc = q.pending.pop_front()?;
    if q.scheme.merges() {
        let mut i = 0;
        while i < q.pending.len() {
            match merge(&mut desc, &mut q.pending[i], max_width) {
                Ok(()) => {
                    q.pending.remove(i);
                    q.stats.merged += 1;
                }
                Err(MergeRefusal::Blocked) => break,
                Err(MergeRefusal::Disjoint | MergeRefusal::TooWide) => i += 1,
            }
        }
    }
    let buf = q.free.pop()?;
    Some((buf, desc))
}

struct Processed {
    image: Option<ImageBuffer>,
    histogram: Histogram,
    zero_copy: bool,
}

/// Run the image processor, or read the framebuffer in place when nothing
/// needs transforming
fn process_update<H>(
    shared: &Shared<H>,
    pxp: &mut PxpState,
    desc: &UpdateDesc,
    image: Option<ImageBuffer>,
) -> Result<Processed, Error> {
    let request = &desc.request;
    let revision = shared.caps.revision;
    let transform = TransformFlags {
        rotation: shared.rotation,
        invert: request.flags.is_set(Flag::ENABLE_INVERSION),
        monochrome: request.flags.is_set(Flag::FORCE_MONOCHROME),
        native_lookup: revision.native_lookup,
    };
    let source = match request.alt_buffer {
        Some(alt) => FrameSource::Alternate(alt),
        None => FrameSource::Framebuffer,
    };

    if transform.is_identity()
        && source == FrameSource::Framebuffer
        && !desc.needs_pause()
        && revision.zero_copy
    {
        let frame = shared
            .framebuffer
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        return Ok(Processed {
            image,
            histogram: Histogram::of_region(&frame, request.region),
            zero_copy: true,
        });
    }

    let dst = image.unwrap_or_else(|| ImageBuffer::with_capacity(shared.buffer_capacity));
    let job = ProcessJob {
        src_region: request.region,
        panel_region: desc.panel_region,
        source,
        transform,
        frame: shared.framebuffer.clone(),
        dst,
    };
    let (done, rx) = JobCompletion::new();
    let handle = pxp
        .processor
        .submit(job, done)
        .map_err(|e| Error::ImageProcessing(format!("{:#}", e)))?;
    match block_on(rx) {
        Ok(Ok(output)) => Ok(Processed {
            image: Some(output.image),
            histogram: output.histogram,
            zero_copy: false,
        }),
        Ok(Err(e)) => Err(Error::ImageProcessing(format!("{:#}", e))),
        Err(_) => Err(Error::ImageProcessing(format!(
            "job {} dropped without completing",
            handle.0
        ))),
    }
}

/// One pass of the submission pipeline. Returns whether any work was taken.
fn submit_work<H: EpdcHardware>(
    shared: &Shared<H>,
    direct: Option<UpdateDesc>,
) -> Result<bool, Error> {
    let mut pxp = lock(&shared.pxp);

    let (desc, image, ambient) = {
        let mut q = lock(&shared.queues);
        let Some((mut buf, desc)) = take_work(&mut q, shared.caps.max_scan_width(), direct) else {
            return Ok(false);
        };
        if let Err(e) = lock(&shared.power).power_up() {
            q.markers.fail(&desc.markers, e.clone());
            q.stats.failures += 1;
            q.release_buffer(buf);
            settle(shared, &mut q);
            return Err(e);
        }
        q.power_down_at = None;
        let image = buf.image.take();
        q.processing = Some(buf);
        (desc, image, q.ambient)
    };

    let temperature = match desc.request.temperature {
        TemperaturePolicy::Fixed(celsius) => celsius,
        TemperaturePolicy::Ambient => ambient,
        TemperaturePolicy::Sensor => match lock(&shared.sensor).read_temperature() {
            Ok(celsius) => celsius,
            Err(e) => {
                log::warn!("Temperature sensor failed, using {} °C: {:#}", ambient, e);
                ambient
            }
        },
    };
    let processed = process_update(shared, &mut pxp, &desc, image);

    let mut q = lock(&shared.queues);
    let Some(mut buf) = q.processing.take() else {
        log::error!("Processing slot emptied under update {}", desc.order);
        return Ok(true);
    };
    let processed = match processed {
        Ok(processed) => processed,
        Err(e) => {
            log::error!("Processing update {} failed: {}", desc.order, e);
            buf.image = Some(ImageBuffer::with_capacity(shared.buffer_capacity));
            q.markers.fail(&desc.markers, e.clone());
            q.stats.failures += 1;
            q.release_buffer(buf);
            settle(shared, &mut q);
            return Err(e);
        }
    };

    let mut desc = desc;
    if desc.request.waveform == WaveformMode::Auto {
        desc.request.waveform = processed.histogram.suggested_waveform();
        log::debug!(
            "Update {} resolved to {} ({} grey levels)",
            desc.order,
            desc.request.waveform,
            processed.histogram.levels()
        );
    }
    buf.image = Some(
        processed
            .image
            .unwrap_or_else(|| ImageBuffer::with_capacity(shared.buffer_capacity)),
    );
    buf.waveform = Some(shared.waveforms.resolve(desc.request.waveform, temperature));
    buf.zero_copy = processed.zero_copy;
    buf.panel_region = desc.panel_region;
    buf.desc = Some(desc);

    if q.current.is_none() && q.queued.is_empty() && q.luts.available() {
        let started = start_update(shared, &mut q, buf);
        settle(shared, &mut q);
        started?;
    } else {
        if q.current.is_none() {
            q.stats.lut_waits += 1;
        }
        q.queued.push_back(buf);
        settle(shared, &mut q);
    }
    Ok(true)
}

/// Bind a processed buffer to a LUT and program the hardware
fn start_update<H: EpdcHardware>(
    shared: &Shared<H>,
    q: &mut Queues<H>,
    mut buf: ProcBuffer,
) -> Result<(), Error> {
    let Some(lut) = q.luts.allocate() else {
        q.queued.push_front(buf);
        return Ok(());
    };
    let (Some(desc), Some(waveform)) = (buf.desc.as_ref(), buf.waveform) else {
        log::error!("Buffer {} queued without an update", buf.index);
        q.release_buffer(buf);
        return Ok(());
    };
    let order = desc.order;
    let keys = desc.markers.clone();
    let dry_run = desc.is_dry_run();
    let pause = desc.needs_pause();
    let mode = desc.request.mode;

    let now = Instant::now();
    let deadline = now + shared.hardware_timeout;
    q.luts.claim(lut, order, deadline);
    q.hw.set_irq_mask(if pause { IrqMask::PAUSED } else { IrqMask::NORMAL });

    let region = buf.panel_region;
    let programmed = {
        let source = match (buf.zero_copy, buf.image.as_ref()) {
            (false, Some(image)) => ScanSource::Image(image),
            _ => ScanSource::Framebuffer {
                phys_addr: shared.fb_phys.start
                    + region.top as u64 * shared.width as u64
                    + region.left as u64,
                stride: shared.width,
            },
        };
        let cmd = UpdateCommand {
            lut,
            region,
            waveform,
            mode,
            dry_run,
            pause,
            source,
        };
        q.hw.program_update(&cmd)
    };
    if let Err(e) = programmed {
        log::error!("Programming update {} on LUT {} failed: {:?}", order, lut, e);
        q.luts.release(lut);
        q.hw.set_irq_mask(IrqMask::NORMAL);
        q.markers.fail(&keys, Error::Interface(e.clone()));
        q.stats.failures += 1;
        q.release_buffer(buf);
        return Err(e.into());
    }

    log::debug!(
        "Update {} on LUT {}: {} waveform {}/{}{}",
        order,
        lut,
        region,
        waveform.mode,
        waveform.temperature_range,
        if pause { " (paused)" } else { "" }
    );
    q.markers.bind_lut(&keys, lut);
    kick_timer(shared);
    q.luts_complete_wb = LutMask::EMPTY;
    q.stats.hardware_submissions += 1;
    buf.lut = Some(lut);
    q.current = Some(InFlight {
        buf,
        stage: if pause {
            WbStage::AwaitingRefine
        } else {
            WbStage::Computing
        },
        deadline,
        cancelled: false,
    });
    if !pause && !dry_run {
        if let Err(e) = lock(&shared.power).commit_scan() {
            log::error!("Committing scan power failed: {}", e);
        }
    }
    Ok(())
}

fn submission_worker<H: EpdcHardware>(shared: Arc<Shared<H>>, mut rx: UnboundedReceiver<Wake>) {
    while let Some(Wake::Kick) = block_on(rx.next()) {
        loop {
            match submit_work(&shared, None) {
                Ok(true) => {}
                Ok(false) => break,
                // the failed update's markers carry the error
                Err(e) => log::error!("Update submission failed: {}", e),
            }
        }
    }
    log::debug!("Submission worker stopped");
}

fn irq_thread<H: EpdcHardware>(shared: Arc<Shared<H>>, mut rx: UnboundedReceiver<Wake>) {
    while let Some(Wake::Kick) = block_on(rx.next()) {
        if shared.irq.take() {
            handle_irq(&shared);
        }
    }
    log::debug!("Interrupt thread stopped");
}

/// Bottom half: snapshot, acknowledge, then apply
fn handle_irq<H: EpdcHardware>(shared: &Shared<H>) {
    let mut guard = lock(&shared.queues);
    let q = &mut *guard;
    let status = q.hw.snapshot_status();
    if status.is_empty() {
        return;
    }
    q.hw.acknowledge(&status);
    log::trace!("IRQ {:?}", status);

    complete_luts(q, &status);
    if status.update_specified {
        release_paused(shared, q);
    }
    if status.wb_done {
        finish_working_buffer(q, &status);
    }
    settle(shared, q);
}

fn complete_luts<H>(q: &mut Queues<H>, status: &StatusBits) {
    for lut in status.finished_luts().iter() {
        let cancelled = status.lut_cancelled.contains(lut);
        if let Some(current) = q.current.as_mut() {
            if cancelled && current.buf.lut == Some(lut) {
                current.cancelled = true;
            }
        }
        if !q.luts.release(lut) {
            log::debug!("Ignoring completion of unowned LUT {}", lut);
            continue;
        }
        if cancelled {
            q.stats.cancelled_luts += 1;
        }
        q.luts_complete_wb.insert(lut);
        for buf in q.collisions.iter_mut() {
            buf.collision_mask.remove(lut);
        }
        q.markers.lut_done(lut);
    }
}

/// Run the refinement pass on the paused update and release its scan
fn release_paused<H: EpdcHardware>(shared: &Shared<H>, q: &mut Queues<H>) {
    let Some(current) = q.current.as_mut() else {
        log::warn!("Update-specified interrupt with nothing in flight");
        return;
    };
    if current.stage != WbStage::AwaitingRefine {
        log::warn!("Update-specified interrupt in stage {:?}", current.stage);
        return;
    }
    let (waveform, dither) = match current.buf.desc.as_ref() {
        Some(desc) => (
            desc.request.waveform,
            desc.request.flags.is_set(Flag::USE_DITHERING),
        ),
        None => (WaveformMode::Refined, false),
    };
    let resumed = match current.buf.image.as_mut() {
        Some(image) => {
            refine::refine(image, waveform, dither);
            q.hw.resume_scan(image)
        }
        None => Err(crate::epdc::error::DisplayError::DataFormatNotImplemented),
    };

    match resumed {
        Ok(()) => {
            current.stage = WbStage::Refined;
            q.hw.set_irq_mask(IrqMask::NORMAL);
            if let Err(e) = lock(&shared.power).commit_scan() {
                log::error!("Committing scan power failed: {}", e);
            }
        }
        Err(e) => {
            log::error!("Releasing paused scan failed: {:?}", e);
            if let Some(InFlight { buf, .. }) = q.current.take() {
                if let Some(lut) = buf.lut {
                    q.leak_lut(lut);
                }
                if let Some(desc) = buf.desc.as_ref() {
                    q.markers.fail(&desc.markers, Error::Interface(e));
                }
                q.stats.failures += 1;
                q.release_buffer(buf);
            }
            q.hw.set_irq_mask(IrqMask::NORMAL);
        }
    }
}

/// Settle the in-flight working buffer: done, superseded or collided
fn finish_working_buffer<H>(q: &mut Queues<H>, status: &StatusBits) {
    let Some(InFlight {
        mut buf,
        stage,
        cancelled,
        ..
    }) = q.current.take()
    else {
        log::warn!("Working-buffer interrupt with nothing in flight");
        return;
    };
    if stage == WbStage::AwaitingRefine {
        log::warn!("Working buffer finished before its refinement pass");
    }
    let Some(desc) = buf.desc.as_ref() else {
        q.release_buffer(buf);
        return;
    };
    let keys = desc.markers.clone();
    let order = desc.order;
    let dry_run = desc.is_dry_run();

    let mut reported = if status.collision {
        status.colliding_luts
    } else {
        LutMask::EMPTY
    };
    if let Some(lut) = buf.lut {
        reported.remove(lut);
    }
    // slots that finished meanwhile no longer block a resubmission
    let colliding = reported
        .without(q.luts_complete_wb)
        .intersection(q.luts.active());

    if dry_run {
        q.markers.set_collision_detected(&keys, !reported.is_empty());
        q.markers.close(&keys);
        q.stats.dry_runs += 1;
        q.release_buffer(buf);
    } else if cancelled || colliding.is_empty() {
        q.markers.close(&keys);
        q.release_buffer(buf);
    } else if q.luts.all_newer(colliding, order) {
        log::debug!(
            "Update {} superseded by LUTs {:?}, dropping it",
            order,
            colliding.iter().collect::<Vec<_>>()
        );
        q.stats.moot_drops += 1;
        q.markers.close(&keys);
        q.release_buffer(buf);
    } else {
        log::debug!(
            "Update {} collided with LUTs {:?}",
            order,
            colliding.iter().collect::<Vec<_>>()
        );
        q.stats.collisions += 1;
        buf.lut = None;
        buf.collision_mask = colliding;
        q.collisions.push(buf);
    }
}

fn timer_thread<H: EpdcHardware>(shared: Arc<Shared<H>>) {
    loop {
        let seq = {
            let timer = lock(&shared.timer);
            if timer.shutdown {
                break;
            }
            timer.seq
        };
        let next = check_deadlines(&shared, Instant::now());

        let mut timer = lock(&shared.timer);
        while !timer.shutdown && timer.seq == seq {
            timer = match next {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        break;
                    }
                    shared
                        .timer_cond
                        .wait_timeout(timer, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => shared
                    .timer_cond
                    .wait(timer)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
    log::debug!("Timer thread stopped");
}

/// Fire expired watchdogs and the power-down; returns the next deadline
fn check_deadlines<H: EpdcHardware>(shared: &Shared<H>, now: Instant) -> Option<Instant> {
    let mut guard = lock(&shared.queues);
    let q = &mut *guard;
    let mut changed = false;

    if q.current.as_ref().is_some_and(|c| c.deadline <= now) {
        if let Some(InFlight { buf, .. }) = q.current.take() {
            log::error!(
                "Working buffer of LUT {:?} timed out, dropping it",
                buf.lut
            );
            if let Some(lut) = buf.lut {
                q.leak_lut(lut);
            }
            if let Some(desc) = buf.desc.as_ref() {
                q.markers
                    .fail(&desc.markers, Error::HardwareTimeout { lut: buf.lut });
            }
            q.stats.timeouts += 1;
            q.release_buffer(buf);
            q.hw.set_irq_mask(IrqMask::NORMAL);
            changed = true;
        }
    }
    for lut in q.luts.expired(now).iter() {
        log::error!("LUT {} never completed, leaking it", lut);
        q.leak_lut(lut);
        q.markers
            .fail_lut(lut, Error::HardwareTimeout { lut: Some(lut) });
        q.stats.timeouts += 1;
        changed = true;
    }
    if changed {
        settle(shared, q);
    }

    if q.power_down_at.is_some_and(|at| at <= now) {
        q.power_down_at = None;
        if q.is_idle() {
            power_down_now(shared);
        }
    }

    [
        q.power_down_at,
        q.current.as_ref().map(|c| c.deadline),
        q.luts.next_deadline(),
    ]
    .into_iter()
    .flatten()
    .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epdc::types::UpdateMode;

    fn queues(pool: usize) -> Queues<()> {
        Queues {
            hw: (),
            pending: VecDeque::new(),
            free: allocate_pool(pool, 0),
            processing: None,
            queued: VecDeque::new(),
            collisions: Vec::new(),
            current: None,
            luts: LutTable::new(4, false),
            luts_complete_wb: LutMask::EMPTY,
            markers: MarkerRegistry::new(),
            order: 0,
            scheme: UpdateScheme::QueueAndMerge,
            power_down_delay: PowerDownDelay::Never,
            power_down_at: None,
            blanked: false,
            ambient: 24,
            stats: EngineStats::default(),
            pool,
        }
    }

    /// Park an update on the collision list with nothing left to wait for
    fn cleared_collision(q: &mut Queues<()>, region: Rect, order: u64) {
        let mut buf = q.free.pop().unwrap();
        let request = UpdateRequest::new(region, WaveformMode::FullGrey, UpdateMode::Partial);
        buf.desc = Some(UpdateDesc::new(request, region, order, Vec::new()));
        q.collisions.push(buf);
    }

    #[test]
    fn cleared_collisions_merge_before_resubmission() {
        let mut q = queues(2);
        cleared_collision(&mut q, Rect::new(0, 0, 10, 10), 1);
        cleared_collision(&mut q, Rect::new(10, 0, 10, 10), 2);

        let (_buf, desc) = take_work(&mut q, 800, None).unwrap();
        assert_eq!(desc.request.region, Rect::new(0, 0, 20, 10));
        assert_eq!(desc.request.waveform, WaveformMode::Auto);
        assert_eq!(desc.order, 2);
        assert!(q.collisions.is_empty());
        assert_eq!(q.free.len(), 1);
        assert_eq!(q.stats.merged, 1);
        assert_eq!(q.stats.resubmissions, 1);
    }

    #[test]
    fn refused_sibling_keeps_its_waveform() {
        let mut q = queues(2);
        cleared_collision(&mut q, Rect::new(0, 0, 10, 10), 1);
        cleared_collision(&mut q, Rect::new(500, 500, 10, 10), 2);

        let (_buf, desc) = take_work(&mut q, 800, None).unwrap();
        assert_eq!(desc.request.region, Rect::new(0, 0, 10, 10));
        assert_eq!(q.collisions.len(), 1);
        let sibling = q.collisions[0].desc.as_ref().unwrap();
        assert_eq!(sibling.request.waveform, WaveformMode::FullGrey);
        assert_eq!(q.stats.merged, 0);
    }
}
