//! Sync engine: the background thread that mirrors the process image.
//!
//! One cycle, while the engine runs:
//!
//! 1. Take the refresh lock, waiting at most one cycle time. A timeout
//!    means a consumer still holds it; the cycle is skipped with a warning.
//! 2. Write pending shared-procimg marks.
//! 3. Read the whole image into a scratch buffer.
//! 4. Per live device, under its lock: copy inputs (everything in
//!    monitoring or shared mode), run change detection against the
//!    snapshot, write outputs back.
//! 5. Flush buffered sources.
//! 6. Fire delayed events that are due.
//! 7. Release the lock, publish new data, sleep to the next cycle boundary.
//!
//! I/O failures are counted; the engine stops when `max_io_errors` is
//! reached (0 = never).
//!
//! Lock order: refresh, device, source. The engine never touches the IO
//! registry.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use procimg_common::config::validate_cycle_time;
use procimg_common::consts::should_warn;
use procimg_common::io::address::IoDescriptor;
use procimg_common::io::types::IoDirection;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceState};
use crate::error::{SyncError, SyncResult};
use crate::events::{DelayTable, EventQueue, FiredEvent, detect, enqueue, spawn_dispatcher};
use crate::signal::{CancelToken, NewData};
use crate::source::{ByteSource, read_exact_at, set_bit, write_all_at};

// ─── Timing ─────────────────────────────────────────────────────────

/// Sleep that ends on the next multiple of `period` since the anchor.
///
/// `since_anchor` is the time since the engine started, `elapsed` the
/// duration of the cycle that just ended. Returns `None` when the cycle
/// overran its period; the next cycle then starts at once.
pub fn drift_corrected_sleep(
    since_anchor: Duration,
    elapsed: Duration,
    period: Duration,
) -> Option<Duration> {
    if period.is_zero() || elapsed > period {
        return None;
    }
    let phase = since_anchor.as_nanos() % period.as_nanos();
    if phase == 0 {
        return Some(Duration::ZERO);
    }
    Some(period - Duration::from_nanos(phase as u64))
}

/// Timing statistics of the engine loop.
#[derive(Debug, Default)]
struct TimingStats {
    /// Completed cycles
    cycle_count: u64,
    /// Cycles longer than the cycle time
    overruns: u64,
    /// Refresh lock not acquired in time
    lock_timeouts: u64,
    /// Longest cycle
    max_cycle_time_us: u64,
    /// Sum for the average
    total_cycle_time_us: u64,
}

// ─── Shared state ───────────────────────────────────────────────────

struct EngineShared {
    /// Live devices; the mutex is the refresh lock.
    live: Mutex<Vec<Arc<Device>>>,
    source: Mutex<Box<dyn ByteSource>>,
    new_data: NewData,
    stop: CancelToken,
    alive: AtomicBool,
    fatal: AtomicBool,
    in_error: AtomicBool,
    cycle_time_ms: AtomicU32,
    monitoring: bool,
    image_len: usize,
    io_errors: AtomicU32,
    max_io_errors: AtomicU32,
    cycle: AtomicU64,
    collect_events: AtomicBool,
    event_cancel: CancelToken,
    inline_queue: EventQueue,
    thread_queue: Arc<EventQueue>,
    delays: Mutex<DelayTable>,
    dispatcher: Mutex<Option<Arc<AtomicBool>>>,
}

impl EngineShared {
    fn cycle_time(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms.load(Ordering::SeqCst) as u64)
    }

    /// One cycle without the sleep; `false` if the refresh lock timed out.
    fn cycle(&self, scratch: &mut [u8], stats: &mut TimingStats) -> bool {
        let Some(live) = self.live.try_lock_for(self.cycle_time()) else {
            stats.lock_timeouts += 1;
            if should_warn(stats.lock_timeouts) {
                warn!(
                    cycle_time_ms = self.cycle_time_ms.load(Ordering::SeqCst),
                    occurrences = stats.lock_timeouts,
                    "cycle time exceeded in your cycle function"
                );
            }
            return false;
        };
        let collect = self.collect_events.load(Ordering::SeqCst);
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);

        let synced = match self.sync_devices(&live, scratch, collect, cycle) {
            Ok(()) => {
                if self.in_error.swap(false, Ordering::SeqCst) {
                    info!(
                        errors = self.io_errors.load(Ordering::SeqCst),
                        "process image access recovered"
                    );
                }
                true
            }
            Err(e) => {
                self.in_error.store(true, Ordering::SeqCst);
                self.count_io_error(&e);
                false
            }
        };
        if collect {
            self.fire_due(&live, cycle);
        }
        drop(live);
        // Stale buffers are no new data.
        if synced {
            self.new_data.notify();
        }
        true
    }

    fn sync_devices(
        &self,
        live: &[Arc<Device>],
        scratch: &mut [u8],
        collect: bool,
        cycle: u64,
    ) -> io::Result<()> {
        for dev in live.iter().filter(|d| d.shared_procimg()) {
            let mut state = dev.lock();
            let mut src = self.source.lock();
            write_shared(src.as_mut(), &mut state)?;
        }

        read_exact_at(self.source.lock().as_mut(), 0, scratch)?;

        for dev in live {
            let mut guard = dev.lock();
            let state = &mut *guard;
            let full = self.monitoring || dev.shared_procimg();
            dev.copy_in(state, scratch, full);

            if collect && !state.events.is_empty() && state.data != state.snapshot {
                self.check_change(dev, state, cycle);
                state.snapshot.clone_from(&state.data);
            }

            if !full {
                let out = dev.section(IoDirection::Output);
                if !out.is_empty() {
                    let mut src = self.source.lock();
                    write_all_at(src.as_mut(), dev.offset() + out.start, &state.data[out])?;
                }
            }
        }

        let mut src = self.source.lock();
        if src.buffered() {
            src.flush()?;
        }
        Ok(())
    }

    fn check_change(&self, dev: &Device, state: &DeviceState, cycle: u64) {
        let cycle_time_ms = self.cycle_time_ms.load(Ordering::SeqCst);
        detect(&state.events, &state.snapshot, &state.data, |watched, spec, value| {
            let event = FiredEvent {
                spec: spec.clone(),
                io_name: watched.io.name.clone(),
                value,
            };
            if spec.delay_ms == 0 {
                enqueue(event, &self.inline_queue, &self.thread_queue);
            } else {
                self.delays.lock().insert(
                    event,
                    dev.position(),
                    watched.io.clone(),
                    cycle,
                    spec.delay_cycles(cycle_time_ms),
                );
            }
        });
    }

    fn fire_due(&self, live: &[Arc<Device>], cycle: u64) {
        let due = self.delays.lock().tick(cycle, |pending| {
            live.iter()
                .find(|d| d.position() == pending.device)
                .map(|d| pending.io.read(&d.lock().data))
        });
        for event in due {
            enqueue(event, &self.inline_queue, &self.thread_queue);
        }
    }

    /// Count an I/O failure; returns the error to hand to a consumer.
    fn count_io_error(&self, err: &io::Error) -> SyncError {
        let count = self.io_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.max_io_errors.load(Ordering::SeqCst);
        if max != 0 && count >= max {
            error!(errors = count, "reached max io errors on process image, stopping sync engine");
            self.fatal.store(true, Ordering::SeqCst);
            self.stop.cancel();
            return SyncError::MaxIoErrors(max);
        }
        if should_warn(count as u64) {
            warn!(errors = count, "got io error on process image: {}", err);
        }
        SyncError::Source(io::Error::new(err.kind(), err.to_string()))
    }

    fn set_collect_events(&self, value: bool) -> SyncResult<()> {
        let mut dispatcher = self.dispatcher.lock();
        if value {
            if dispatcher.is_some() {
                return Ok(());
            }
            self.delays.lock().clear();
            self.inline_queue.clear();
            self.thread_queue.clear();
            self.event_cancel.reset();
            let active = Arc::new(AtomicBool::new(true));
            spawn_dispatcher(
                Arc::clone(&self.thread_queue),
                Arc::clone(&active),
                self.event_cancel.clone(),
            )?;
            *dispatcher = Some(active);
            self.collect_events.store(true, Ordering::SeqCst);
        } else {
            self.collect_events.store(false, Ordering::SeqCst);
            if let Some(active) = dispatcher.take() {
                active.store(false, Ordering::SeqCst);
            }
            self.event_cancel.cancel();
            self.inline_queue.clear();
            self.thread_queue.clear();
            self.delays.lock().clear();
        }
        Ok(())
    }
}

/// Write the IOs marked for direct write and clear their marks.
///
/// Bits go through the set-bit ioctl (or its fallback), bytes through seek
/// and write. Marks that were not written stay for the next attempt.
pub(crate) fn write_shared(src: &mut dyn ByteSource, state: &mut DeviceState) -> io::Result<()> {
    let marks = std::mem::take(&mut state.shared_marks);
    for (idx, io) in marks.iter().enumerate() {
        if let Err(e) = write_io(src, io, &state.data) {
            state.shared_marks = marks[idx..].to_vec();
            return Err(e);
        }
    }
    if src.buffered() && !marks.is_empty() {
        src.flush()?;
    }
    Ok(())
}

fn write_io(src: &mut dyn ByteSource, io: &IoDescriptor, data: &[u8]) -> io::Result<()> {
    match io.bit {
        Some(bit) => set_bit(src, io.address, bit, io.read_bit(data).unwrap_or(false)),
        None => write_all_at(src, io.address, io.raw(data)),
    }
}

fn run(shared: Arc<EngineShared>) {
    info!(
        cycle_time_ms = shared.cycle_time_ms.load(Ordering::SeqCst),
        "sync engine started"
    );
    let mut scratch = vec![0u8; shared.image_len];
    let mut stats = TimingStats::default();
    let anchor = Instant::now();

    while !shared.stop.is_cancelled() {
        let cycle_start = Instant::now();
        if !shared.cycle(&mut scratch, &mut stats) {
            continue;
        }
        let period = shared.cycle_time();
        let elapsed = cycle_start.elapsed();
        let cycle_time_us = elapsed.as_micros() as u64;
        stats.cycle_count += 1;
        stats.total_cycle_time_us += cycle_time_us;
        stats.max_cycle_time_us = stats.max_cycle_time_us.max(cycle_time_us);

        match drift_corrected_sleep(anchor.elapsed(), elapsed, period) {
            Some(pause) => {
                shared.stop.wait_timeout(pause);
            }
            None => {
                stats.overruns += 1;
                if should_warn(stats.overruns) {
                    warn!(
                        "cycle time of {} ms exceeded - can not hold cycle time (took {}us)",
                        period.as_millis(),
                        cycle_time_us
                    );
                }
            }
        }

        if stats.cycle_count % 1000 == 0 {
            debug!(
                "Sync loop: {} cycles, avg={}us, max={}us, overruns={}",
                stats.cycle_count,
                stats.total_cycle_time_us / stats.cycle_count,
                stats.max_cycle_time_us,
                stats.overruns
            );
        }
    }

    if let Err(e) = shared.set_collect_events(false) {
        warn!("can not stop event collection: {}", e);
    }
    shared.new_data.notify();
    shared.alive.store(false, Ordering::SeqCst);
    info!(
        "sync engine stopped after {} cycles (overruns: {})",
        stats.cycle_count, stats.overruns
    );
}

// ─── SyncEngine ─────────────────────────────────────────────────────

/// Handle of the sync engine and its state.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("alive", &self.is_alive())
            .field("cycle_time_ms", &self.cycle_time_ms())
            .field("io_errors", &self.io_errors())
            .finish()
    }
}

impl SyncEngine {
    /// Engine over `source`, not started.
    ///
    /// `image_len` bytes are read every cycle.
    pub fn new(
        source: Box<dyn ByteSource>,
        image_len: usize,
        monitoring: bool,
        cycle_time_ms: u32,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                live: Mutex::new(Vec::new()),
                source: Mutex::new(source),
                new_data: NewData::new(),
                stop: CancelToken::new(),
                alive: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                in_error: AtomicBool::new(false),
                cycle_time_ms: AtomicU32::new(cycle_time_ms),
                monitoring,
                image_len,
                io_errors: AtomicU32::new(0),
                max_io_errors: AtomicU32::new(0),
                cycle: AtomicU64::new(0),
                collect_events: AtomicBool::new(false),
                event_cancel: CancelToken::new(),
                inline_queue: EventQueue::new(),
                thread_queue: Arc::new(EventQueue::new()),
                delays: Mutex::new(DelayTable::new()),
                dispatcher: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start the engine thread if it is not running.
    pub fn start(&self) -> SyncResult<()> {
        let mut thread = self.thread.lock();
        if self.is_alive() {
            return Ok(());
        }
        if let Some(old) = thread.take() {
            let _ = old.join();
        }
        self.shared.stop.reset();
        self.shared.fatal.store(false, Ordering::SeqCst);
        self.shared.alive.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("procimg-sync".into())
            .spawn(move || run(shared))
            .inspect_err(|_| self.shared.alive.store(false, Ordering::SeqCst))?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the engine and wait for the running cycle to finish.
    ///
    /// Must not be called while holding the refresh lock.
    pub fn stop(&self) {
        self.shared.stop.cancel();
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            error!("sync engine thread panicked");
        }
        self.shared.alive.store(false, Ordering::SeqCst);
    }

    /// True while the engine thread runs.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// True if the engine stopped on the I/O error threshold.
    pub fn failed(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }

    /// Run one cycle in the calling thread, without sleeping.
    ///
    /// Returns `false` if the refresh lock could not be taken in time.
    pub fn cycle_once(&self) -> bool {
        let mut scratch = vec![0u8; self.shared.image_len];
        self.shared.cycle(&mut scratch, &mut TimingStats::default())
    }

    // ─── Settings ───────────────────────────────────────────────────

    /// Cycle time in milliseconds.
    pub fn cycle_time_ms(&self) -> u32 {
        self.shared.cycle_time_ms.load(Ordering::SeqCst)
    }

    /// Change the cycle time (5..=2000 ms).
    pub fn set_cycle_time(&self, ms: u32) -> SyncResult<()> {
        validate_cycle_time(ms)?;
        self.shared.cycle_time_ms.store(ms, Ordering::SeqCst);
        Ok(())
    }

    /// True in monitoring mode.
    pub fn monitoring(&self) -> bool {
        self.shared.monitoring
    }

    /// Bytes read per cycle.
    pub fn image_len(&self) -> usize {
        self.shared.image_len
    }

    // ─── Live devices ───────────────────────────────────────────────

    /// Take the refresh lock; no cycle runs while it is held.
    pub fn lock_refresh(&self) -> MutexGuard<'_, Vec<Arc<Device>>> {
        self.shared.live.lock()
    }

    /// Number of live devices.
    pub fn live_count(&self) -> usize {
        self.shared.live.lock().len()
    }

    // ─── Source access ──────────────────────────────────────────────

    /// Run `f` with exclusive access to the byte source.
    pub fn with_source<T>(&self, f: impl FnOnce(&mut dyn ByteSource) -> io::Result<T>) -> io::Result<T> {
        let mut src = self.shared.source.lock();
        f(src.as_mut())
    }

    /// Like [`with_source`](Self::with_source), failures count as I/O errors.
    pub fn access<T>(&self, f: impl FnOnce(&mut dyn ByteSource) -> io::Result<T>) -> SyncResult<T> {
        self.with_source(f).map_err(|e| self.record_io_error(&e))
    }

    /// Count a failure of a consumer-side access.
    ///
    /// Returns `MaxIoErrors` once the threshold is reached, which also stops
    /// the engine.
    pub fn record_io_error(&self, err: &io::Error) -> SyncError {
        self.shared.count_io_error(err)
    }

    /// Close the byte source.
    pub fn close_source(&self) -> io::Result<()> {
        self.shared.source.lock().close()
    }

    // ─── Signals and errors ─────────────────────────────────────────

    /// "New data available" signal.
    pub fn new_data(&self) -> &NewData {
        &self.shared.new_data
    }

    /// I/O errors counted so far.
    pub fn io_errors(&self) -> u32 {
        self.shared.io_errors.load(Ordering::SeqCst)
    }

    /// Reset the I/O error counter.
    pub fn reset_io_errors(&self) {
        self.shared.io_errors.store(0, Ordering::SeqCst);
    }

    /// Error threshold, 0 = unlimited.
    pub fn max_io_errors(&self) -> u32 {
        self.shared.max_io_errors.load(Ordering::SeqCst)
    }

    /// Set the error threshold, 0 = unlimited.
    pub fn set_max_io_errors(&self, max: u32) {
        self.shared.max_io_errors.store(max, Ordering::SeqCst);
    }

    // ─── Events ─────────────────────────────────────────────────────

    /// Queue drained by the mainloop.
    pub fn inline_queue(&self) -> &EventQueue {
        &self.shared.inline_queue
    }

    /// Token handed to callbacks, cancelled when collection stops.
    pub fn event_cancel(&self) -> &CancelToken {
        &self.shared.event_cancel
    }

    /// True while events are collected.
    pub fn collecting_events(&self) -> bool {
        self.shared.collect_events.load(Ordering::SeqCst)
    }

    /// Start collecting events.
    ///
    /// Under the refresh lock every snapshot is refreshed and prefire
    /// registrations whose edge matches the current value are queued.
    pub fn enable_events(&self) -> SyncResult<()> {
        let live = self.shared.live.lock();
        self.shared.set_collect_events(true)?;
        for dev in live.iter() {
            let mut guard = dev.lock();
            let state = &mut *guard;
            state.snapshot.clone_from(&state.data);
            for watched in &state.events {
                let value = watched.io.read(&state.data);
                for spec in watched.specs.iter().filter(|s| s.prefire) {
                    if spec.edge.matches(value.truthy()) {
                        enqueue(
                            FiredEvent {
                                spec: spec.clone(),
                                io_name: watched.io.name.clone(),
                                value: value.clone(),
                            },
                            &self.shared.inline_queue,
                            &self.shared.thread_queue,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop collecting events and drop everything queued or delayed.
    pub fn disable_events(&self) -> SyncResult<()> {
        self.shared.set_collect_events(false)
    }

    /// Delayed events waiting for their cycle.
    pub fn pending_delays(&self) -> usize {
        self.shared.delays.lock().len()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
