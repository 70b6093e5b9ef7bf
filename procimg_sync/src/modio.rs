//! Process image manager.
//!
//! [`ProcessImage`] ties the parts together: it builds devices and IOs from
//! the piCtory configuration, owns the [`SyncEngine`] and offers the consumer
//! API. [`IoHandle`] and [`DeviceHandle`] are cheap, cloneable views that
//! resolve their target on every call.
//!
//! Lock order: refresh lock, IO registry, device registry, device lock,
//! byte source. Nothing here takes the refresh lock while holding a
//! registry lock.

use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sched::{CpuSet, sched_getaffinity};
use nix::unistd::Pid;
use parking_lot::RwLock;
use procimg_common::config::{DeviceKey, SyncSettings};
use procimg_common::consts::{
    DEFAULT_CYCLE_TIME_MS, DIO_COUNTER_ADDRESSES, EVENT_QUEUE_POLL, IOCTL_RELAY_COUNTERS,
    IOCTL_RESET_COUNTER, IOCTL_SET_BIT, LIVENESS_TIMEOUT, RELAY_COUNTERS,
    RELAY_COUNTERS_ARG_LEN, SINGLE_CPU_CYCLE_TIME_MS,
};
use procimg_common::io::address::{IoDescriptor, IoKind};
use procimg_common::io::config::{DevicePosition, PiCtoryConfig};
use procimg_common::io::format::IoValue;
use procimg_common::io::registry::IoRegistry;
use procimg_common::io::replace::ReplaceRequest;
use procimg_common::io::replace_file::{self, ReplaceDefinition};
use procimg_common::io::types::{ByteOrder, Edge, IoCapabilities, IoDirection};
use procimg_common::io::IoError;
use tracing::{debug, error, info, warn};

use crate::cycletools::Cycletools;
use crate::device::{Device, DeviceKind};
use crate::device_registry::DeviceRegistry;
use crate::engine::{SyncEngine, write_shared};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventHandler, EventSpec, WatchedIo};
use crate::signal::CancelToken;
use crate::source::{ByteSource, FileSource, read_exact_at, simulate_set_bit, write_all_at};

/// Cycle time when none is configured: slower on single-CPU systems.
fn default_cycle_time() -> u32 {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => {
            let cpus = (0..CpuSet::count())
                .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
                .count();
            if cpus <= 1 {
                SINGLE_CPU_CYCLE_TIME_MS
            } else {
                DEFAULT_CYCLE_TIME_MS
            }
        }
        Err(e) => {
            debug!("can not read cpu affinity: {}", e);
            DEFAULT_CYCLE_TIME_MS
        }
    }
}

// ─── ProcessImage ───────────────────────────────────────────────────

struct Inner {
    settings: SyncSettings,
    ios: RwLock<IoRegistry>,
    devices: RwLock<DeviceRegistry>,
    engine: SyncEngine,
    exit: CancelToken,
    wait_exit: CancelToken,
    exit_full: AtomicBool,
    loop_running: AtomicBool,
}

/// A process image with its devices, IOs and sync engine.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct ProcessImage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessImage")
            .field("devices", &self.inner.devices.read().len())
            .field("ios", &self.inner.ios.read().len())
            .field("engine", &self.inner.engine)
            .finish()
    }
}

impl ProcessImage {
    // ─── Construction ───────────────────────────────────────────────

    /// Open the image described by `settings`.
    ///
    /// Reads the piCtory configuration and opens the device file, writable
    /// unless in monitoring mode.
    pub fn open(settings: SyncSettings) -> SyncResult<Self> {
        settings.validate()?;
        let rsc = settings.resolve_config_rsc()?;
        let config = PiCtoryConfig::load(&rsc)?;
        info!(config = %rsc.display(), procimg = %settings.procimg.display(), "opening process image");
        let source = FileSource::open(&settings.procimg, !settings.monitoring)?;
        Self::from_parts(settings, config, Box::new(source))
    }

    /// Build an image over an already parsed configuration and source.
    ///
    /// Startup order: devices, replace file, output sync, autorefresh.
    pub fn from_parts(
        settings: SyncSettings,
        mut config: PiCtoryConfig,
        source: Box<dyn ByteSource>,
    ) -> SyncResult<Self> {
        settings.validate()?;
        config.select(&settings.devices, settings.device_type.as_deref());

        let mut ios = IoRegistry::new();
        let mut devices = DeviceRegistry::new();
        for record in &config.devices {
            let position = match record.position {
                DevicePosition::Fixed(p) => p,
                DevicePosition::Adapter => devices.next_adapter_position(),
            };
            let image_len = devices.image_len();
            if let Some(device) =
                Device::build(record, position, image_len, settings.simulator, &mut ios)?
            {
                device.set_shared_procimg(settings.shared_procimg);
                devices.add(device)?;
            }
        }

        let cycle_time = settings.cycle_time_ms.unwrap_or_else(default_cycle_time);
        let engine = SyncEngine::new(source, devices.image_len(), settings.monitoring, cycle_time);
        engine.set_max_io_errors(settings.max_io_errors);
        info!(
            devices = devices.len(),
            ios = ios.len(),
            length = devices.image_len(),
            cycle_time_ms = cycle_time,
            "process image built"
        );

        let image = Self {
            inner: Arc::new(Inner {
                settings,
                ios: RwLock::new(ios),
                devices: RwLock::new(devices),
                engine,
                exit: CancelToken::new(),
                wait_exit: CancelToken::new(),
                exit_full: AtomicBool::new(false),
                loop_running: AtomicBool::new(false),
            }),
        };

        if let Some(path) = image.inner.settings.replace_io_file.clone() {
            image.import_replaced_ios(&path)?;
        }
        if image.inner.settings.syncoutputs && !image.is_monitoring() {
            image.sync_outputs()?;
        }
        if image.inner.settings.autorefresh {
            image.autorefresh_all()?;
        }
        Ok(image)
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Settings the image was opened with.
    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// The sync engine.
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    /// True in monitoring mode.
    pub fn is_monitoring(&self) -> bool {
        self.inner.settings.monitoring
    }

    /// True in simulator mode.
    pub fn is_simulator(&self) -> bool {
        self.inner.settings.simulator
    }

    /// Bytes covered by the devices.
    pub fn length(&self) -> usize {
        self.inner.engine.image_len()
    }

    /// Token set by [`exit`](Self::exit); callbacks may watch it.
    pub fn exit_signal(&self) -> CancelToken {
        self.inner.exit.clone()
    }

    /// True while `mainloop` or `cycleloop` runs.
    pub fn loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::SeqCst)
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    /// IO by name; replaced names resolve to their replacement.
    pub fn io(&self, name: &str) -> SyncResult<IoHandle> {
        let ios = self.inner.ios.read();
        let io = ios.require(name)?;
        Ok(IoHandle {
            image: self.clone(),
            name: io.name.clone(),
        })
    }

    /// All IOs, ordered by address.
    pub fn ios(&self) -> Vec<IoHandle> {
        self.inner
            .ios
            .read()
            .iter()
            .map(|io| self.handle(io))
            .collect()
    }

    fn handle(&self, io: &IoDescriptor) -> IoHandle {
        IoHandle {
            image: self.clone(),
            name: io.name.clone(),
        }
    }

    /// Device by position or name.
    pub fn device(&self, key: impl Into<DeviceKey>) -> SyncResult<DeviceHandle> {
        let device = Arc::clone(self.inner.devices.read().get(&key.into())?);
        Ok(DeviceHandle {
            image: self.clone(),
            device,
        })
    }

    /// All devices, ordered by offset.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.inner
            .devices
            .read()
            .iter()
            .map(|device| DeviceHandle {
                image: self.clone(),
                device: Arc::clone(device),
            })
            .collect()
    }

    fn device_at(&self, position: u16) -> SyncResult<Arc<Device>> {
        self.inner
            .devices
            .read()
            .by_position(position)
            .cloned()
            .ok_or_else(|| SyncError::UnknownDevice(position.to_string()))
    }

    // ─── Replace ────────────────────────────────────────────────────

    /// Replace `parent` with a new IO.
    ///
    /// The new IO must stay inside the device section of `parent`. Events of
    /// absorbed IOs are dropped.
    pub fn replace_io(&self, parent: &str, request: &ReplaceRequest) -> SyncResult<IoHandle> {
        let mut ios = self.inner.ios.write();
        let devices = self.inner.devices.read();
        let id = ios.replace(parent, request, |anchor| {
            devices
                .by_position(anchor.device)
                .map(|d| d.absolute(anchor.direction))
                .unwrap_or_else(|| anchor.span())
        })?;
        let io = ios
            .descriptor(id)
            .ok_or_else(|| IoError::UnknownIo(request.name.clone()))?;
        if let Some(device) = devices.by_position(io.device) {
            let mut state = device.lock();
            state.events.retain(|w| {
                let keep = ios.contains(&w.io.name);
                if !keep {
                    debug!(io = w.io.name.as_str(), "events of replaced io dropped");
                }
                keep
            });
        }
        debug!(io = io.name.as_str(), parent, "io replaced");
        Ok(self.handle(io))
    }

    /// Write all replacements to an INI file.
    pub fn export_replaced_ios(&self, path: &Path) -> SyncResult<()> {
        let definitions: Vec<ReplaceDefinition> = self
            .inner
            .ios
            .read()
            .iter()
            .filter_map(ReplaceDefinition::from_descriptor)
            .collect();
        replace_file::save(path, &definitions)?;
        info!(count = definitions.len(), path = %path.display(), "replaced ios exported");
        Ok(())
    }

    /// Apply the replacements of an INI file.
    pub fn import_replaced_ios(&self, path: &Path) -> SyncResult<()> {
        let definitions = replace_file::load(path)?;
        for def in &definitions {
            self.replace_io(&def.parent, &def.request)?;
        }
        info!(count = definitions.len(), path = %path.display(), "replaced ios imported");
        Ok(())
    }

    // ─── Autorefresh ────────────────────────────────────────────────

    /// Add a device to the sync engine or remove it.
    pub fn autorefresh(&self, key: impl Into<DeviceKey>, enable: bool) -> SyncResult<()> {
        let device = Arc::clone(self.inner.devices.read().get(&key.into())?);
        self.set_autorefresh(&device, enable)
    }

    /// Add every device to the sync engine.
    pub fn autorefresh_all(&self) -> SyncResult<()> {
        let devices: Vec<Arc<Device>> = self.inner.devices.read().iter().cloned().collect();
        for device in &devices {
            self.set_autorefresh(device, true)?;
        }
        Ok(())
    }

    fn set_autorefresh(&self, device: &Arc<Device>, enable: bool) -> SyncResult<()> {
        let engine = &self.inner.engine;
        if enable {
            if device.is_autorefresh() {
                return Ok(());
            }
            self.read_devices(std::slice::from_ref(device))?;
            {
                let mut live = engine.lock_refresh();
                let mut guard = device.lock();
                let state = &mut *guard;
                state.snapshot.clone_from(&state.data);
                device.set_autorefresh(true);
                live.push(Arc::clone(device));
            }
            debug!(device = device.name(), "autorefresh on");
            engine.start()
        } else {
            if !device.is_autorefresh() {
                return Ok(());
            }
            let now_empty = {
                let mut live = engine.lock_refresh();
                live.retain(|d| !Arc::ptr_eq(d, device));
                device.set_autorefresh(false);
                live.is_empty()
            };
            debug!(device = device.name(), "autorefresh off");
            if now_empty {
                engine.stop();
            }
            if !self.is_monitoring() {
                self.write_devices(std::slice::from_ref(device))?;
            }
            Ok(())
        }
    }

    // ─── Bulk operations ────────────────────────────────────────────

    fn manual_devices(&self) -> Vec<Arc<Device>> {
        self.inner
            .devices
            .read()
            .iter()
            .filter(|d| !d.is_autorefresh())
            .cloned()
            .collect()
    }

    /// Read inputs of every device that is not in autorefresh.
    pub fn read_procimg(&self) -> SyncResult<()> {
        self.read_devices(&self.manual_devices())
    }

    /// Write outputs of every device that is not in autorefresh.
    pub fn write_procimg(&self) -> SyncResult<()> {
        if self.is_monitoring() {
            return Err(SyncError::MonitoringMode("write process image"));
        }
        self.write_devices(&self.manual_devices())
    }

    /// Pull current outputs of every device that is not in autorefresh.
    pub fn sync_outputs(&self) -> SyncResult<()> {
        self.sync_device_outputs(&self.manual_devices())
    }

    /// Set every output of every device to its default.
    pub fn set_default_values(&self) -> SyncResult<()> {
        let devices: Vec<Arc<Device>> = self.inner.devices.read().iter().cloned().collect();
        self.write_defaults(&devices)
    }

    fn read_devices(&self, devices: &[Arc<Device>]) -> SyncResult<()> {
        let engine = &self.inner.engine;
        let mut image = vec![0u8; engine.image_len()];
        engine.access(|src| read_exact_at(src, 0, &mut image))?;
        for device in devices {
            let mut state = device.lock();
            let full = self.is_monitoring() || device.shared_procimg();
            device.copy_in(&mut state, &image, full);
        }
        Ok(())
    }

    fn write_devices(&self, devices: &[Arc<Device>]) -> SyncResult<()> {
        let engine = &self.inner.engine;
        let mut failure = None;
        for device in devices {
            let mut state = device.lock();
            let result = if device.shared_procimg() {
                engine.with_source(|src| write_shared(src, &mut state))
            } else {
                let out = device.section(IoDirection::Output);
                engine.with_source(|src| {
                    write_all_at(src, device.offset() + out.start, &state.data[out.clone()])
                })
            };
            if let Err(e) = result {
                warn!(device = device.name(), "can not write outputs: {}", e);
                failure = Some(e);
            }
        }
        let flushed = engine.with_source(|src| if src.buffered() { src.flush() } else { Ok(()) });
        match failure.map_or(flushed, Err) {
            Ok(()) => Ok(()),
            Err(e) => Err(engine.record_io_error(&e)),
        }
    }

    fn sync_device_outputs(&self, devices: &[Arc<Device>]) -> SyncResult<()> {
        let engine = &self.inner.engine;
        let mut image = vec![0u8; engine.image_len()];
        engine.access(|src| read_exact_at(src, 0, &mut image))?;
        for device in devices {
            let mut state = device.lock();
            device.copy_outputs_in(&mut state, &image);
        }
        Ok(())
    }

    fn write_defaults(&self, devices: &[Arc<Device>]) -> SyncResult<()> {
        if self.is_monitoring() {
            return Err(SyncError::MonitoringMode("set default values"));
        }
        let ios = self.inner.ios.read();
        for device in devices {
            let mut state = device.lock();
            for io in ios
                .device_ios(device.position())
                .filter(|io| io.direction == IoDirection::Output)
            {
                io.write_default(&mut state.data);
                if device.shared_procimg() {
                    state.mark_shared(io);
                }
            }
        }
        Ok(())
    }

    fn explicit(device: &Arc<Device>) -> SyncResult<()> {
        if device.is_autorefresh() {
            return Err(SyncError::DeviceInAutorefresh(device.name().to_string()));
        }
        Ok(())
    }

    // ─── Cycle time and errors ──────────────────────────────────────

    /// Current cycle time.
    pub fn cycle_time_ms(&self) -> u32 {
        self.inner.engine.cycle_time_ms()
    }

    /// Change the cycle time; not while a loop runs.
    pub fn set_cycle_time(&self, ms: u32) -> SyncResult<()> {
        if self.loop_running() {
            return Err(SyncError::LoopRunning);
        }
        self.inner.engine.set_cycle_time(ms)
    }

    /// I/O errors counted so far.
    pub fn io_errors(&self) -> u32 {
        self.inner.engine.io_errors()
    }

    /// Reset the I/O error counter.
    pub fn reset_io_errors(&self) {
        self.inner.engine.reset_io_errors();
    }

    /// Set the error threshold, 0 = unlimited.
    pub fn set_max_io_errors(&self, max: u32) {
        self.inner.engine.set_max_io_errors(max);
    }

    fn engine_lost(&self) -> SyncError {
        let engine = &self.inner.engine;
        if engine.failed() {
            SyncError::MaxIoErrors(engine.max_io_errors())
        } else {
            SyncError::EngineNotRunning
        }
    }

    // ─── ioctl ──────────────────────────────────────────────────────

    /// Issue an ioctl, falling back to [`simulate_ioctl`](Self::simulate_ioctl)
    /// when the source has none.
    fn ioctl(&self, request: u32, arg: &mut [u8]) -> SyncResult<()> {
        let engine = &self.inner.engine;
        match engine.with_source(|src| src.ioctl(request, arg)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => self.simulate_ioctl(request, arg),
            Err(e) => Err(engine.record_io_error(&e)),
        }
    }

    /// Emulate the set-bit and counter-reset ioctls with plain reads and
    /// writes.
    pub fn simulate_ioctl(&self, request: u32, arg: &[u8]) -> SyncResult<()> {
        let engine = &self.inner.engine;
        match request {
            IOCTL_SET_BIT => engine.access(|src| simulate_set_bit(src, arg)),
            IOCTL_RESET_COUNTER => {
                let [position, _, lo, hi, ..] = *arg else {
                    return Err(invalid_arg(request, arg.len()));
                };
                let device = self.device_at(position as u16)?;
                let mask = u16::from_le_bytes([lo, hi]);
                let counter = (0..DIO_COUNTER_ADDRESSES.len())
                    .find(|i| mask & (1 << i) != 0)
                    .ok_or_else(|| invalid_arg(request, arg.len()))?;
                let address = device.offset() + DIO_COUNTER_ADDRESSES[counter];
                engine.access(|src| {
                    write_all_at(src, address, &[0; 4])?;
                    if src.buffered() {
                        src.flush()?;
                    }
                    Ok(())
                })
            }
            other => Err(SyncError::UnsupportedIoctl(other)),
        }
    }

    // ─── Loops ──────────────────────────────────────────────────────

    fn enter_loop(&self) -> SyncResult<()> {
        if self.inner.engine.live_count() == 0 {
            return Err(SyncError::NoLiveDevices);
        }
        if self.inner.loop_running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::LoopRunning);
        }
        self.inner.exit.reset();
        Ok(())
    }

    /// Dispatch events until [`exit`](Self::exit) is called.
    ///
    /// Inline callbacks run here in order; a callback error ends the loop.
    /// Devices leave autorefresh on return only after `exit(true)` or when
    /// the sync engine was lost.
    pub fn mainloop(&self) -> SyncResult<()> {
        self.enter_loop()?;
        info!("mainloop started");
        let result = self.dispatch_events();
        if let Err(e) = self.inner.engine.disable_events() {
            warn!("can not stop event collection: {}", e);
        }
        self.inner.loop_running.store(false, Ordering::SeqCst);
        self.leave_loop(result.as_ref().err());
        info!("mainloop stopped");
        result
    }

    fn dispatch_events(&self) -> SyncResult<()> {
        let engine = &self.inner.engine;
        engine.enable_events()?;
        let queue = engine.inline_queue();
        let cancel = engine.event_cancel().clone();
        let mut burst: Option<Instant> = None;
        let mut measure = true;

        while !self.inner.exit.is_cancelled() {
            if queue.is_empty() {
                burst = None;
                measure = true;
            }
            let Some(event) = queue.pop_timeout(EVENT_QUEUE_POLL) else {
                if !self.inner.exit.is_cancelled() && !engine.is_alive() {
                    return Err(self.engine_lost());
                }
                continue;
            };
            let started = *burst.get_or_insert_with(Instant::now);
            event.spec.handler.call(&event.context(&cancel))?;
            let budget = Duration::from_millis(engine.cycle_time_ms() as u64);
            if measure && started.elapsed() > budget {
                measure = false;
                warn!("can not execute all event functions in one cycle - optimize your event functions or raise the cycle time");
            }
        }
        Ok(())
    }

    /// Call `func` once per cycle while holding the refresh lock.
    ///
    /// Ends when `func` returns `Some`, after the cycle in which
    /// [`exit`](Self::exit) was called, or on error. `cycle_time_ms`
    /// overrides the cycle time for the duration of the loop.
    pub fn cycleloop<T, F>(&self, mut func: F, cycle_time_ms: Option<u32>) -> SyncResult<Option<T>>
    where
        F: FnMut(&mut Cycletools) -> SyncResult<Option<T>>,
    {
        let engine = &self.inner.engine;
        let previous = engine.cycle_time_ms();
        let cycle_time = cycle_time_ms.unwrap_or(previous);
        self.enter_loop()?;
        if cycle_time != previous {
            if let Err(e) = engine.set_cycle_time(cycle_time) {
                self.inner.loop_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            let seen = engine.new_data().generation();
            engine
                .new_data()
                .wait_newer(seen, Duration::from_millis(previous.max(cycle_time) as u64));
        }
        info!(cycle_time_ms = cycle_time, "cycleloop started");

        let mut tools = Cycletools::new(cycle_time, self.clone());
        let result = self.run_cycles(&mut func, &mut tools);

        self.inner.loop_running.store(false, Ordering::SeqCst);
        if let Err(e) = engine.set_cycle_time(previous) {
            warn!("can not restore cycle time: {}", e);
        }
        self.leave_loop(result.as_ref().err());
        info!("cycleloop stopped");
        result
    }

    fn run_cycles<T, F>(&self, func: &mut F, tools: &mut Cycletools) -> SyncResult<Option<T>>
    where
        F: FnMut(&mut Cycletools) -> SyncResult<Option<T>>,
    {
        let engine = &self.inner.engine;
        let mut seen = engine.new_data().generation();
        while !tools.last {
            match engine.new_data().wait_newer(seen, LIVENESS_TIMEOUT) {
                Some(generation) => seen = generation,
                None => {
                    if !engine.is_alive() {
                        return Err(self.engine_lost());
                    }
                    warn!("no new io data in cycle loop for {} milliseconds", LIVENESS_TIMEOUT.as_millis());
                    tools.last = self.inner.exit.is_cancelled();
                    continue;
                }
            }
            if engine.failed() {
                return Err(self.engine_lost());
            }

            let _refresh = engine.lock_refresh();
            tools.begin_cycle(self.inner.exit.is_cancelled());
            let outcome = func(tools)?;
            tools.end_cycle();
            if outcome.is_some() {
                return Ok(outcome);
            }
        }
        Ok(None)
    }

    /// Leave a running loop and wake every waiting IO.
    ///
    /// With `full` the engine stops, every device leaves autorefresh and
    /// outputs are written: right away when no loop runs, otherwise when
    /// the loop returns. Without `full` autorefresh keeps running.
    pub fn exit(&self, full: bool) {
        if full {
            self.inner.exit_full.store(true, Ordering::SeqCst);
        }
        self.inner.exit.cancel();
        self.inner.wait_exit.cancel();
        if !self.loop_running() {
            self.exit_jobs(false);
        }
    }

    fn leave_loop(&self, error: Option<&SyncError>) {
        if error.is_some() {
            self.inner.exit.cancel();
            self.inner.wait_exit.cancel();
        }
        self.exit_jobs(error.is_some_and(SyncError::is_fatal));
    }

    /// [`exit`](Self::exit) with `full` and close the byte source.
    pub fn cleanup(&self) -> SyncResult<()> {
        self.exit(true);
        self.inner.engine.close_source()?;
        Ok(())
    }

    /// Tear down autorefresh if a full exit was requested or `fatal` is set.
    fn exit_jobs(&self, fatal: bool) {
        if !self.inner.exit_full.swap(false, Ordering::SeqCst) && !fatal {
            return;
        }
        let engine = &self.inner.engine;
        engine.stop();
        let released: Vec<Arc<Device>> = {
            let mut live = engine.lock_refresh();
            live.drain(..).collect()
        };
        for device in &released {
            device.set_autorefresh(false);
        }
        if !self.is_monitoring()
            && !released.is_empty()
            && let Err(e) = self.write_devices(&released)
        {
            error!("can not write outputs on exit: {}", e);
        }
    }
}

fn invalid_arg(request: u32, len: usize) -> SyncError {
    SyncError::Source(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid argument of {len} bytes for ioctl {request}"),
    ))
}

// ─── IoHandle ───────────────────────────────────────────────────────

/// Result of [`IoHandle::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The value changed as requested.
    Changed,
    /// The value already equalled `ok_value`.
    OkValue,
    /// The caller's exit token was set.
    ExitEvent,
    /// The timeout expired.
    Timeout,
    /// [`ProcessImage::exit`] was called.
    Exited,
}

impl WaitOutcome {
    /// Numeric code: 0, -1, 1, 2 or 100.
    pub fn code(self) -> i32 {
        match self {
            Self::Changed => 0,
            Self::OkValue => -1,
            Self::ExitEvent => 1,
            Self::Timeout => 2,
            Self::Exited => 100,
        }
    }
}

/// Relay switching counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchingCycles {
    /// Counter of a single relay bit.
    Single(u32),
    /// Counters of all relays of the device.
    All([u32; RELAY_COUNTERS]),
}

/// Named access to one IO.
#[derive(Debug, Clone)]
pub struct IoHandle {
    image: ProcessImage,
    name: String,
}

impl IoHandle {
    /// IO name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current descriptor.
    pub fn descriptor(&self) -> SyncResult<IoDescriptor> {
        Ok(self.image.inner.ios.read().require(&self.name)?.clone())
    }

    fn target(&self) -> SyncResult<(IoDescriptor, Arc<Device>)> {
        let io = self.descriptor()?;
        let device = self.image.device_at(io.device)?;
        Ok((io, device))
    }

    /// Owning device.
    pub fn device(&self) -> SyncResult<DeviceHandle> {
        let (_, device) = self.target()?;
        Ok(DeviceHandle {
            image: self.image.clone(),
            device,
        })
    }

    /// Absolute byte address.
    pub fn address(&self) -> SyncResult<usize> {
        Ok(self.descriptor()?.address)
    }

    /// Byte length, 0 for bits.
    pub fn length(&self) -> SyncResult<usize> {
        Ok(self.descriptor()?.length)
    }

    /// Byte order.
    pub fn byte_order(&self) -> SyncResult<ByteOrder> {
        Ok(self.descriptor()?.byte_order)
    }

    /// Configured default.
    pub fn default_value(&self) -> SyncResult<IoValue> {
        Ok(self.descriptor()?.default_value())
    }

    /// Current value from the device buffer.
    pub fn value(&self) -> SyncResult<IoValue> {
        let (io, device) = self.target()?;
        let state = device.lock();
        Ok(io.read(&state.data))
    }

    /// Set an output value.
    ///
    /// The engine writes it with the next cycle, or immediately on the next
    /// shared write when the device uses the shared process image.
    pub fn set_value(&self, value: impl Into<IoValue>) -> SyncResult<()> {
        let (io, device) = self.target()?;
        match io.direction {
            IoDirection::Output => {}
            IoDirection::Input if self.image.is_simulator() => {
                return Err(SyncError::SimulatorReadOnly(io.name));
            }
            direction => {
                return Err(SyncError::ReadOnly {
                    name: io.name,
                    direction,
                });
            }
        }
        let mut state = device.lock();
        io.write(&mut state.data, &value.into())?;
        if device.shared_procimg() {
            state.mark_shared(&io);
        }
        Ok(())
    }

    /// Reset a DIO counter input.
    pub fn reset(&self) -> SyncResult<()> {
        let io = self.descriptor()?;
        let IoKind::Counter { id } = io.kind else {
            return Err(SyncError::Capability {
                name: io.name,
                operation: "counter reset",
            });
        };
        if self.image.is_monitoring() {
            return Err(SyncError::MonitoringMode("reset counter"));
        }
        if self.image.is_simulator() {
            return Err(SyncError::SimulatorMode("reset counter"));
        }
        let mask = (1u16 << id).to_le_bytes();
        let mut arg = [io.device as u8, 0, mask[0], mask[1]];
        self.image.ioctl(IOCTL_RESET_COUNTER, &mut arg)
    }

    /// Switching cycles of a relay output.
    ///
    /// A bit relay yields its own counter, a byte relay all of them.
    pub fn switching_cycles(&self) -> SyncResult<SwitchingCycles> {
        let io = self.descriptor()?;
        if !io.capabilities().contains(IoCapabilities::SUPPORTS_COUNTER_QUERY) {
            return Err(SyncError::Capability {
                name: io.name,
                operation: "switching cycles",
            });
        }
        let engine = &self.image.inner.engine;
        let mut arg = [0u8; RELAY_COUNTERS_ARG_LEN];
        arg[0] = io.device as u8;
        match engine.with_source(|src| src.ioctl(IOCTL_RELAY_COUNTERS, &mut arg)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                return Err(SyncError::UnsupportedIoctl(IOCTL_RELAY_COUNTERS));
            }
            Err(e) => return Err(engine.record_io_error(&e)),
        }
        let counters: [u32; RELAY_COUNTERS] = std::array::from_fn(|i| {
            let at = 1 + 4 * i;
            u32::from_le_bytes([arg[at], arg[at + 1], arg[at + 2], arg[at + 3]])
        });
        match io.bit {
            Some(bit) => counters
                .get(bit as usize)
                .map(|&c| SwitchingCycles::Single(c))
                .ok_or(SyncError::Capability {
                    name: io.name,
                    operation: "switching cycles",
                }),
            None => Ok(SwitchingCycles::All(counters)),
        }
    }

    /// Block until the value changes.
    ///
    /// `edge` other than `Both` needs a bit IO. Returns at once with
    /// `OkValue` if the value equals `ok_value`. `timeout_ms` of 0 waits
    /// forever; time is counted in cycles, plus 2.5 s per missing cycle.
    pub fn wait(
        &self,
        edge: Edge,
        exit: Option<&CancelToken>,
        ok_value: Option<&IoValue>,
        timeout_ms: u32,
    ) -> SyncResult<WaitOutcome> {
        let (io, device) = self.target()?;
        if !device.is_autorefresh() {
            return Err(SyncError::NoAutorefresh(device.name().to_string()));
        }
        if edge != Edge::Both && !io.is_bit() {
            return Err(SyncError::InvalidEdge(io.name));
        }
        let read = || io.read(&device.lock().data);
        if ok_value.is_some_and(|ok| read() == *ok) {
            return Ok(WaitOutcome::OkValue);
        }

        let inner = &self.image.inner;
        let engine = &inner.engine;
        let exit = exit.cloned().unwrap_or_default();
        inner.wait_exit.reset();
        let timeout = Duration::from_millis(timeout_ms as u64);
        let mut counted = Duration::ZERO;
        let mut start = read();
        let mut seen = engine.new_data().generation();

        while !inner.wait_exit.is_cancelled()
            && !exit.is_cancelled()
            && (timeout_ms == 0 || counted < timeout)
        {
            match engine.new_data().wait_newer(seen, LIVENESS_TIMEOUT) {
                Some(generation) => seen = generation,
                None => {
                    if !engine.is_alive() {
                        return Err(self.image.engine_lost());
                    }
                    counted += LIVENESS_TIMEOUT;
                    continue;
                }
            }
            counted += Duration::from_millis(engine.cycle_time_ms() as u64);

            let now = read();
            if edge == Edge::Both {
                if now != start {
                    return Ok(WaitOutcome::Changed);
                }
            } else if now.truthy() != start.truthy() {
                if edge.matches(now.truthy()) {
                    return Ok(WaitOutcome::Changed);
                }
                start = now;
            }
        }

        Ok(if inner.wait_exit.is_cancelled() {
            WaitOutcome::Exited
        } else if exit.is_cancelled() {
            WaitOutcome::ExitEvent
        } else {
            WaitOutcome::Timeout
        })
    }

    /// Register a callback.
    ///
    /// The same handler may be registered again only with the other
    /// non-`Both` edge. Prefire registrations are rejected while the
    /// mainloop runs.
    pub fn reg_event(&self, spec: EventSpec) -> SyncResult<()> {
        let (io, device) = self.target()?;
        if spec.edge != Edge::Both && !io.is_bit() {
            return Err(SyncError::InvalidEdge(io.name));
        }
        if spec.prefire && self.image.loop_running() {
            return Err(SyncError::PrefireWhileRunning);
        }
        let mut state = device.lock();
        match state.events.iter().position(|w| w.io.name == io.name) {
            None => state.events.push(WatchedIo {
                io,
                specs: vec![spec],
            }),
            Some(idx) => {
                let watched = &mut state.events[idx];
                if let Some(existing) = watched.specs.iter().find(|s| {
                    s.handler.same(&spec.handler)
                        && (s.edge == Edge::Both || spec.edge == Edge::Both || s.edge == spec.edge)
                }) {
                    return Err(SyncError::DuplicateCallback {
                        name: io.name,
                        edge: existing.edge,
                    });
                }
                watched.specs.push(spec);
            }
        }
        Ok(())
    }

    /// Register a timer callback: a repeated trigger does not restart the
    /// delay.
    pub fn reg_timer_event(&self, spec: EventSpec) -> SyncResult<()> {
        self.reg_event(spec.overwrite(false))
    }

    /// Remove registrations.
    ///
    /// Without a handler everything goes; with one, only its registrations,
    /// optionally only those with `edge`.
    pub fn unreg_event(&self, handler: Option<&EventHandler>, edge: Option<Edge>) -> SyncResult<()> {
        let (io, device) = self.target()?;
        let mut state = device.lock();
        let events = &mut state.events;
        match handler {
            None => events.retain(|w| w.io.name != io.name),
            Some(handler) => {
                for watched in events.iter_mut().filter(|w| w.io.name == io.name) {
                    watched
                        .specs
                        .retain(|s| !s.handler.same(handler) || edge.is_some_and(|e| s.edge != e));
                }
                events.retain(|w| !w.specs.is_empty());
            }
        }
        Ok(())
    }

    /// Replace this IO with a new one.
    pub fn replace(&self, request: &ReplaceRequest) -> SyncResult<IoHandle> {
        self.image.replace_io(&self.name, request)
    }

    /// Set the export flag.
    pub fn set_export(&self, value: bool) -> SyncResult<()> {
        let mut ios = self.image.inner.ios.write();
        let id = ios
            .id_of(&self.name)
            .ok_or_else(|| IoError::UnknownIo(self.name.clone()))?;
        if let Some(io) = ios.descriptor_mut(id) {
            io.set_export(value);
        }
        Ok(())
    }
}

// ─── DeviceHandle ───────────────────────────────────────────────────

/// Access to one device and its IOs.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    image: ProcessImage,
    device: Arc<Device>,
}

impl Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl DeviceHandle {
    fn ios_where(&self, keep: impl Fn(&IoDescriptor) -> bool) -> Vec<IoHandle> {
        self.image
            .inner
            .ios
            .read()
            .device_ios(self.device.position())
            .filter(|io| keep(io))
            .map(|io| self.image.handle(io))
            .collect()
    }

    /// Input IOs by address.
    pub fn inputs(&self) -> Vec<IoHandle> {
        self.ios_where(|io| io.direction == IoDirection::Input)
    }

    /// Output IOs by address.
    pub fn outputs(&self) -> Vec<IoHandle> {
        self.ios_where(|io| io.direction == IoDirection::Output)
    }

    /// Memory IOs by address.
    pub fn memories(&self) -> Vec<IoHandle> {
        self.ios_where(|io| io.direction == IoDirection::Memory)
    }

    /// All IOs, optionally only those with a matching export flag.
    pub fn all_ios(&self, export: Option<bool>) -> Vec<IoHandle> {
        self.ios_where(|io| export.is_none_or(|e| io.export_flag() == e))
    }

    /// Add this device to the sync engine or remove it.
    pub fn autorefresh(&self, enable: bool) -> SyncResult<()> {
        self.image.set_autorefresh(&self.device, enable)
    }

    /// Read this device's inputs.
    pub fn read_procimg(&self) -> SyncResult<()> {
        ProcessImage::explicit(&self.device)?;
        self.image.read_devices(std::slice::from_ref(&self.device))
    }

    /// Write this device's outputs.
    pub fn write_procimg(&self) -> SyncResult<()> {
        if self.image.is_monitoring() {
            return Err(SyncError::MonitoringMode("write process image"));
        }
        ProcessImage::explicit(&self.device)?;
        self.image.write_devices(std::slice::from_ref(&self.device))
    }

    /// Pull this device's outputs from the image.
    pub fn sync_outputs(&self) -> SyncResult<()> {
        ProcessImage::explicit(&self.device)?;
        self.image
            .sync_device_outputs(std::slice::from_ref(&self.device))
    }

    /// Set every output to its default.
    pub fn set_default_values(&self) -> SyncResult<()> {
        self.image.write_defaults(std::slice::from_ref(&self.device))
    }

    /// Write the default of every input of a virtual device to the image.
    pub fn write_input_defaults(&self) -> SyncResult<()> {
        if self.device.kind() != DeviceKind::Virtual {
            return Err(SyncError::Capability {
                name: self.device.name().to_string(),
                operation: "input defaults",
            });
        }
        if self.image.is_monitoring() {
            return Err(SyncError::MonitoringMode("write process image"));
        }
        let ios = self.image.inner.ios.read();
        let mut state = self.device.lock();
        for io in ios
            .device_ios(self.device.position())
            .filter(|io| io.direction == IoDirection::Input)
        {
            io.write_default(&mut state.data);
        }
        let inputs = self.device.section(IoDirection::Input);
        let engine = &self.image.inner.engine;
        engine.access(|src| {
            write_all_at(src, self.device.offset() + inputs.start, &state.data[inputs.clone()])?;
            if src.buffered() {
                src.flush()?;
            }
            Ok(())
        })
    }
}
