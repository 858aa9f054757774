//! Completion markers
//!
//! A [`Marker`] is the caller's handle on one update. The engine keeps a
//! registry entry per marker, guarded by the queue lock, recording which LUTs
//! the update still depends on. Resolving an entry removes it and signals the
//! marker in the same step, so no marker is ever delivered twice.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::epdc::error::Error;
use crate::epdc::lut::LutMask;
use crate::epdc::types::UpdateOutcome;

pub(crate) type MarkerKey = u64;

#[derive(Debug, Default)]
struct MarkerState {
    submitted: bool,
    outcome: Option<Result<UpdateOutcome, Error>>,
}

#[derive(Debug, Default)]
struct MarkerShared {
    state: Mutex<MarkerState>,
    cond: Condvar,
}

impl MarkerShared {
    fn lock(&self) -> MutexGuard<'_, MarkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `done` holds for the state, or the timeout passes
    fn wait_until<T>(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&MarkerState) -> Option<T>,
    ) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(result) = done(&*state) {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Caller-visible completion handle; clones wait on the same update
#[derive(Debug, Clone)]
pub struct Marker {
    id: u32,
    shared: Arc<MarkerShared>,
}

impl Marker {
    /// Opaque id given with the request
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until the update has been handed to the hardware.
    ///
    /// An update that finished without reaching the hardware, for example
    /// one that was superseded, counts as submitted.
    pub fn wait_submitted(&self, timeout: Duration) -> Result<(), Error> {
        self.shared
            .wait_until(timeout, |state| match &state.outcome {
                Some(Err(e)) => Some(Err(e.clone())),
                Some(Ok(_)) => Some(Ok(())),
                None => state.submitted.then_some(Ok(())),
            })?
    }

    /// Block until the update is visible on the panel.
    ///
    /// Expiry returns [`Error::Timeout`]; it means the engine is wedged.
    pub fn wait_complete(&self, timeout: Duration) -> Result<UpdateOutcome, Error> {
        self.shared
            .wait_until(timeout, |state| state.outcome.clone())?
    }

    pub fn is_submitted(&self) -> bool {
        self.shared.lock().submitted
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }
}

#[derive(Debug)]
struct Entry {
    key: MarkerKey,
    id: u32,
    /// LUTs the update still waits on
    luts: LutMask,
    /// More LUTs may be bound until the working buffer settles
    open: bool,
    collision_detected: bool,
    shared: Arc<MarkerShared>,
}

/// Registry of unresolved markers
#[derive(Debug, Default)]
pub(crate) struct MarkerRegistry {
    next_key: MarkerKey,
    entries: Vec<Entry>,
}

impl MarkerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, id: u32) -> (MarkerKey, Marker) {
        self.next_key += 1;
        let shared = Arc::new(MarkerShared::default());
        self.entries.push(Entry {
            key: self.next_key,
            id,
            luts: LutMask::EMPTY,
            open: true,
            collision_detected: false,
            shared: shared.clone(),
        });
        (self.next_key, Marker { id, shared })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// LUTs each pending marker depends on, by marker id
    pub(crate) fn dependencies(&self) -> Vec<(u32, LutMask)> {
        self.entries.iter().map(|e| (e.id, e.luts)).collect()
    }

    /// Record the LUT an update was programmed on and signal "submitted"
    pub(crate) fn bind_lut(&mut self, keys: &[MarkerKey], lut: u8) {
        for entry in self.entries.iter_mut().filter(|e| keys.contains(&e.key)) {
            entry.luts.insert(lut);
            let mut state = entry.shared.lock();
            if !state.submitted {
                state.submitted = true;
                entry.shared.cond.notify_all();
            }
        }
    }

    pub(crate) fn set_collision_detected(&mut self, keys: &[MarkerKey], detected: bool) {
        for entry in self.entries.iter_mut().filter(|e| keys.contains(&e.key)) {
            entry.collision_detected = detected;
        }
    }

    /// No further LUTs will be bound for these markers
    pub(crate) fn close(&mut self, keys: &[MarkerKey]) {
        for entry in self.entries.iter_mut().filter(|e| keys.contains(&e.key)) {
            entry.open = false;
        }
        self.resolve_finished();
    }

    pub(crate) fn lut_done(&mut self, lut: u8) {
        for entry in self.entries.iter_mut() {
            entry.luts.remove(lut);
        }
        self.resolve_finished();
    }

    pub(crate) fn fail(&mut self, keys: &[MarkerKey], error: Error) {
        self.resolve_where(|e| keys.contains(&e.key), |_| Err(error.clone()));
    }

    /// Fail every marker waiting on a LUT
    pub(crate) fn fail_lut(&mut self, lut: u8, error: Error) {
        self.resolve_where(|e| e.luts.contains(lut), |_| Err(error.clone()));
    }

    pub(crate) fn fail_all(&mut self, error: Error) {
        self.resolve_where(|_| true, |_| Err(error.clone()));
    }

    fn resolve_finished(&mut self) {
        self.resolve_where(
            |e| !e.open && e.luts.is_empty(),
            |e| {
                Ok(UpdateOutcome {
                    collision_detected: e.collision_detected,
                })
            },
        );
    }

    fn resolve_where(
        &mut self,
        mut pick: impl FnMut(&Entry) -> bool,
        mut outcome: impl FnMut(&Entry) -> Result<UpdateOutcome, Error>,
    ) {
        let mut i = 0;
        while i < self.entries.len() {
            if !pick(&self.entries[i]) {
                i += 1;
                continue;
            }
            let entry = self.entries.swap_remove(i);
            let result = outcome(&entry);
            match &result {
                Ok(_) => log::debug!("Marker {} complete", entry.id),
                Err(e) => log::warn!("Marker {} failed: {}", entry.id, e),
            }
            let mut state = entry.shared.lock();
            state.submitted = true;
            state.outcome = Some(result);
            entry.shared.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn resolves_after_close_and_lut_done() {
        let mut registry = MarkerRegistry::new();
        let (key, marker) = registry.register(7);
        registry.bind_lut(&[key], 3);
        assert!(marker.wait_submitted(SHORT).is_ok());
        registry.close(&[key]);
        assert!(!marker.is_complete());
        registry.lut_done(3);
        assert_eq!(marker.wait_complete(SHORT).unwrap(), UpdateOutcome::default());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn collided_update_stays_open_across_luts() {
        let mut registry = MarkerRegistry::new();
        let (key, marker) = registry.register(1);
        registry.bind_lut(&[key], 0);
        registry.lut_done(0);
        // still open: the update was parked on the collision list
        assert!(!marker.is_complete());
        registry.bind_lut(&[key], 1);
        registry.close(&[key]);
        registry.lut_done(1);
        assert!(marker.is_complete());
    }

    #[test]
    fn failure_is_delivered_once() {
        let mut registry = MarkerRegistry::new();
        let (key, marker) = registry.register(2);
        registry.bind_lut(&[key], 5);
        registry.fail_lut(5, Error::HardwareTimeout { lut: Some(5) });
        // a late completion finds nothing left to signal
        registry.close(&[key]);
        registry.lut_done(5);
        assert!(matches!(
            marker.wait_complete(SHORT),
            Err(Error::HardwareTimeout { lut: Some(5) })
        ));
        assert!(matches!(
            marker.wait_submitted(SHORT),
            Err(Error::HardwareTimeout { .. })
        ));
    }

    #[test]
    fn waiting_times_out() {
        let mut registry = MarkerRegistry::new();
        let (_, marker) = registry.register(3);
        assert!(matches!(marker.wait_complete(SHORT), Err(Error::Timeout)));
        assert!(matches!(marker.wait_submitted(SHORT), Err(Error::Timeout)));
    }

    #[test]
    fn waiter_on_another_thread_wakes() {
        let mut registry = MarkerRegistry::new();
        let (key, marker) = registry.register(4);
        let waiter = {
            let marker = marker.clone();
            thread::spawn(move || marker.wait_complete(Duration::from_secs(5)))
        };
        registry.set_collision_detected(&[key], true);
        registry.close(&[key]);
        let outcome = waiter.join().unwrap().unwrap();
        assert!(outcome.collision_detected);
    }
}
