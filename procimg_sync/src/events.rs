//! Event/timer subsystem.
//!
//! Change detection compares a device buffer against the snapshot of the
//! previous cycle. Every registered [`EventSpec`] whose edge filter matches
//! yields a [`FiredEvent`]. Events without delay go straight to one of two
//! queues; delayed events wait in the [`DelayTable`] until their due cycle.
//!
//! # Queues
//!
//! - inline: drained in order by `ProcessImage::mainloop`.
//! - thread: drained by [`spawn_dispatcher`], one worker thread per event.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use procimg_common::consts::EVENT_QUEUE_POLL;
use procimg_common::io::address::IoDescriptor;
use procimg_common::io::format::IoValue;
use procimg_common::io::types::Edge;
use tracing::{debug, error};

use crate::error::SyncResult;
use crate::signal::CancelToken;

// ─── Handlers and specs ─────────────────────────────────────────────

/// What a callback gets to see.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Name of the IO that triggered.
    pub io_name: String,
    /// Value at trigger time.
    pub value: IoValue,
    /// Cancelled when event collection stops.
    pub cancel: CancelToken,
}

type Callback = dyn Fn(&EventContext) -> SyncResult<()> + Send + Sync;

/// Shared callback; identity is the allocation, not the code.
#[derive(Clone)]
pub struct EventHandler(Arc<Callback>);

impl EventHandler {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EventContext) -> SyncResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Same registration target as `other`.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Run the callback.
    pub fn call(&self, ctx: &EventContext) -> SyncResult<()> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHandler({:p})", Arc::as_ptr(&self.0))
    }
}

/// One registration of a callback on an IO.
#[derive(Debug, Clone)]
pub struct EventSpec {
    /// Callback.
    pub handler: EventHandler,
    /// Edge filter, only bits may use something other than `Both`.
    pub edge: Edge,
    /// Run on a worker thread instead of the mainloop.
    pub as_thread: bool,
    /// Delay before firing, in milliseconds.
    pub delay_ms: u32,
    /// Restart a pending delay on a repeated trigger and drop it when the
    /// value reverts.
    pub overwrite: bool,
    /// Fire once with the current value when the mainloop starts.
    pub prefire: bool,
}

impl EventSpec {
    /// Immediate, inline, `Both` edges.
    pub fn new(handler: EventHandler) -> Self {
        Self {
            handler,
            edge: Edge::Both,
            as_thread: false,
            delay_ms: 0,
            overwrite: true,
            prefire: false,
        }
    }

    /// Set the edge filter.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edge = edge;
        self
    }

    /// Run on a worker thread.
    pub fn as_thread(mut self) -> Self {
        self.as_thread = true;
        self
    }

    /// Fire `ms` milliseconds after the trigger.
    pub fn delay(mut self, ms: u32) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Choose the repeat policy of a delayed event.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Fire once at mainloop start.
    pub fn prefire(mut self) -> Self {
        self.prefire = true;
        self
    }

    /// Delay in whole cycles, rounded up.
    pub fn delay_cycles(&self, cycle_time_ms: u32) -> u64 {
        (self.delay_ms as u64).div_ceil(cycle_time_ms.max(1) as u64)
    }
}

/// An IO with its registrations, kept in the owning device.
#[derive(Debug, Clone)]
pub struct WatchedIo {
    /// Descriptor at registration time.
    pub io: IoDescriptor,
    /// Registrations in order.
    pub specs: Vec<EventSpec>,
}

/// An event ready for dispatch.
#[derive(Debug, Clone)]
pub struct FiredEvent {
    /// Registration that fired.
    pub spec: EventSpec,
    /// IO name.
    pub io_name: String,
    /// Value at trigger time.
    pub value: IoValue,
}

impl FiredEvent {
    /// Context handed to the callback.
    pub fn context(&self, cancel: &CancelToken) -> EventContext {
        EventContext {
            io_name: self.io_name.clone(),
            value: self.value.clone(),
            cancel: cancel.clone(),
        }
    }
}

// ─── Detection ──────────────────────────────────────────────────────

/// Compare `old` and `new` device buffers and report matching triggers.
///
/// Byte IOs fire all their registrations on any change, bit IOs only when
/// their own bit changed in the direction of the edge filter.
pub fn detect<F>(watched: &[WatchedIo], old: &[u8], new: &[u8], mut emit: F)
where
    F: FnMut(&WatchedIo, &EventSpec, IoValue),
{
    for entry in watched {
        let Some(level) = entry.io.detect_change(old, new) else {
            continue;
        };
        let value = entry.io.read(new);
        for spec in &entry.specs {
            if !entry.io.is_bit() || spec.edge.matches(level) {
                emit(entry, spec, value.clone());
            }
        }
    }
}

// ─── Delays ─────────────────────────────────────────────────────────

/// A delayed event waiting for its due cycle.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// The event to fire.
    pub event: FiredEvent,
    /// Device position of the IO.
    pub device: u16,
    /// Descriptor used to read the current value.
    pub io: IoDescriptor,
    /// Cycle at which it fires.
    pub due: u64,
}

/// Pending delayed events keyed by (callback, IO, trigger value).
#[derive(Debug, Default)]
pub struct DelayTable {
    pending: Vec<PendingEvent>,
}

impl DelayTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Schedule `event` triggered in `cycle` to fire `delay` cycles later.
    ///
    /// A repeated trigger restarts the delay for overwrite registrations and
    /// is ignored otherwise.
    pub fn insert(&mut self, event: FiredEvent, device: u16, io: IoDescriptor, cycle: u64, delay: u64) {
        let due = cycle + delay;
        let existing = self.pending.iter_mut().find(|p| {
            p.event.spec.handler.same(&event.spec.handler)
                && p.event.io_name == event.io_name
                && p.event.value == event.value
        });
        match existing {
            Some(p) if event.spec.overwrite => p.due = due,
            Some(_) => {}
            None => self.pending.push(PendingEvent {
                event,
                device,
                io,
                due,
            }),
        }
    }

    /// Collect the events due in `cycle`.
    ///
    /// `current` reads the present value of a pending IO; overwrite entries
    /// whose value moved away from the trigger value are dropped unfired.
    pub fn tick<F>(&mut self, cycle: u64, mut current: F) -> Vec<FiredEvent>
    where
        F: FnMut(&PendingEvent) -> Option<IoValue>,
    {
        let mut fired = Vec::new();
        self.pending.retain(|p| {
            if p.event.spec.overwrite && current(p).is_some_and(|v| v != p.event.value) {
                return false;
            }
            if cycle >= p.due {
                fired.push(p.event.clone());
                return false;
            }
            true
        });
        fired
    }
}

// ─── Queues ─────────────────────────────────────────────────────────

/// FIFO of fired events with a blocking pop.
#[derive(Debug, Default)]
pub struct EventQueue {
    items: Mutex<VecDeque<FiredEvent>>,
    cond: Condvar,
}

impl EventQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and wake one waiter.
    pub fn push(&self, event: FiredEvent) {
        self.items.lock().push_back(event);
        self.cond.notify_one();
    }

    /// Oldest event, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FiredEvent> {
        let mut items = self.items.lock();
        if items.is_empty() {
            let _ = self.cond.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Route an immediate event to its queue.
pub fn enqueue(event: FiredEvent, inline: &EventQueue, threaded: &EventQueue) {
    if event.spec.as_thread {
        threaded.push(event);
    } else {
        inline.push(event);
    }
}

// ─── Thread dispatcher ──────────────────────────────────────────────

/// Drain `queue` while `active` is set, one worker thread per event.
pub fn spawn_dispatcher(
    queue: Arc<EventQueue>,
    active: Arc<AtomicBool>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("procimg-events".into())
        .spawn(move || {
            debug!("event dispatcher started");
            while active.load(Ordering::SeqCst) {
                let Some(event) = queue.pop_timeout(EVENT_QUEUE_POLL) else {
                    continue;
                };
                let ctx = event.context(&cancel);
                let handler = event.spec.handler.clone();
                let spawned = thread::Builder::new()
                    .name(format!("event-{}", event.io_name))
                    .spawn(move || {
                        if let Err(e) = handler.call(&ctx) {
                            error!(io = ctx.io_name.as_str(), "event callback failed: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    error!(io = event.io_name.as_str(), "can not start event thread: {}", e);
                }
            }
            debug!("event dispatcher stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use procimg_common::io::address::{DefaultSpec, IoKind, RecordPlacement};
    use procimg_common::io::types::{ByteOrder, IoDirection};

    fn io(name: &str, start: usize, bit: Option<u32>) -> IoDescriptor {
        IoDescriptor::from_record(
            name,
            &DefaultSpec::None,
            if bit.is_some() { 1 } else { 16 },
            start,
            false,
            "",
            bit,
            RecordPlacement {
                device: 32,
                device_offset: 0,
                direction: IoDirection::Output,
                byte_order: ByteOrder::Little,
                signed: false,
                kind: if bit.is_some() { IoKind::Raw } else { IoKind::Int },
            },
        )
        .unwrap()
    }

    fn noop() -> EventHandler {
        EventHandler::new(|_| Ok(()))
    }

    fn fired(spec: &EventSpec, value: bool) -> FiredEvent {
        FiredEvent {
            spec: spec.clone(),
            io_name: "O_1".into(),
            value: IoValue::Bool(value),
        }
    }

    #[test]
    fn rising_edge_fires_once_for_sequence() {
        let watched = vec![WatchedIo {
            io: io("O_1", 0, Some(0)),
            specs: vec![EventSpec::new(noop()).edge(Edge::Rising)],
        }];
        let frames: [[u8; 1]; 4] = [[0x00], [0x01], [0x01], [0x00]];
        let mut evaluations = 0;
        let mut events = 0;
        for pair in frames.windows(2) {
            if watched[0].io.detect_change(&pair[0], &pair[1]).is_some() {
                evaluations += 1;
            }
            detect(&watched, &pair[0], &pair[1], |_, _, _| events += 1);
        }
        assert_eq!(evaluations, 2);
        assert_eq!(events, 1);
    }

    #[test]
    fn sibling_bit_is_not_a_trigger() {
        let watched = vec![WatchedIo {
            io: io("O_1", 0, Some(2)),
            specs: vec![EventSpec::new(noop())],
        }];
        let mut events = 0;
        detect(&watched, &[0b0000_0000], &[0b0000_0010], |_, _, _| events += 1);
        assert_eq!(events, 0);
    }

    #[test]
    fn byte_io_fires_every_spec() {
        let watched = vec![WatchedIo {
            io: io("counter", 0, None),
            specs: vec![EventSpec::new(noop()), EventSpec::new(noop()).as_thread()],
        }];
        let mut values = Vec::new();
        detect(&watched, &[0, 0], &[0x2c, 0x01], |_, _, v| values.push(v));
        assert_eq!(values, vec![IoValue::Int(300), IoValue::Int(300)]);
    }

    #[test]
    fn overwrite_restarts_the_delay() {
        let spec = EventSpec::new(noop()).delay(30);
        let delay = spec.delay_cycles(10);
        assert_eq!(delay, 3);
        let mut table = DelayTable::new();
        let target = io("O_1", 0, Some(0));

        table.insert(fired(&spec, true), 32, target.clone(), 0, delay);
        table.insert(fired(&spec, true), 32, target, 1, delay);
        assert_eq!(table.len(), 1);

        let mut fired_at = None;
        for cycle in 0..10 {
            if !table.tick(cycle, |_| Some(IoValue::Bool(true))).is_empty() {
                fired_at = Some(cycle);
                break;
            }
        }
        assert_eq!(fired_at, Some(4));
    }

    #[test]
    fn repeat_without_overwrite_keeps_the_first_due_cycle() {
        let spec = EventSpec::new(noop()).delay(30).overwrite(false);
        let mut table = DelayTable::new();
        let target = io("O_1", 0, Some(0));

        table.insert(fired(&spec, true), 32, target.clone(), 0, 3);
        table.insert(fired(&spec, true), 32, target, 1, 3);

        let mut fired_at = None;
        for cycle in 0..10 {
            if !table.tick(cycle, |_| Some(IoValue::Bool(false))).is_empty() {
                fired_at = Some(cycle);
                break;
            }
        }
        assert_eq!(fired_at, Some(3));
    }

    #[test]
    fn overwrite_entry_dropped_when_value_reverts() {
        let spec = EventSpec::new(noop()).delay(20);
        let mut table = DelayTable::new();
        table.insert(fired(&spec, true), 32, io("O_1", 0, Some(0)), 0, 2);

        assert!(table.tick(1, |_| Some(IoValue::Bool(false))).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn queue_routes_by_thread_flag() {
        let inline = EventQueue::new();
        let threaded = EventQueue::new();
        let spec = EventSpec::new(noop());
        enqueue(fired(&spec, true), &inline, &threaded);
        enqueue(fired(&spec.clone().as_thread(), true), &inline, &threaded);
        assert_eq!(inline.len(), 1);
        assert_eq!(threaded.len(), 1);
        assert!(inline.pop_timeout(Duration::from_millis(1)).is_some());
        assert!(inline.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn handler_identity() {
        let a = noop();
        let b = noop();
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }
}
