//! Toolbox handed to the `cycleloop` function.
//!
//! Clock flags toggle every N cycles (`flag5c` is 5 cycles false, then 5
//! cycles true); flank flags are true for exactly one cycle every N cycles.
//! All flank flags are true in the first cycle.
//!
//! Timers count cycles. Millisecond variants round up to whole cycles.
//!
//! | Timer | set                         | get                       |
//! |-------|-----------------------------|---------------------------|
//! | TON   | keep calling while input on | true once the delay ran   |
//! | TOF   | call while input on         | true until the delay ran  |
//! | TP    | call once to start          | true for the pulse length |

use std::collections::HashMap;
use std::time::Instant;

use procimg_common::io::format::IoValue;
use procimg_common::io::types::Edge;

use crate::error::{SyncError, SyncResult};
use crate::modio::{IoHandle, ProcessImage};

/// Remaining cycles and "called this cycle" flag of a TON or TP timer.
#[derive(Debug, Clone, Copy)]
struct Timer {
    remaining: i64,
    armed: bool,
}

/// Flags, timers and change detection for cycle functions.
#[derive(Debug)]
pub struct Cycletools {
    /// True in the first cycle only.
    pub first: bool,
    /// True in the last cycle before the loop ends.
    pub last: bool,
    /// Toggles every cycle.
    pub flag1c: bool,
    /// Toggles every 5 cycles.
    pub flag5c: bool,
    /// Toggles every 10 cycles.
    pub flag10c: bool,
    /// Toggles every 15 cycles.
    pub flag15c: bool,
    /// Toggles every 20 cycles.
    pub flag20c: bool,
    /// True every 5th cycle.
    pub flank5c: bool,
    /// True every 10th cycle.
    pub flank10c: bool,
    /// True every 15th cycle.
    pub flank15c: bool,
    /// True every 20th cycle.
    pub flank20c: bool,

    image: ProcessImage,
    cycle_time_ms: u32,
    cycle: u32,
    fives: u32,
    ton: HashMap<String, Timer>,
    tof: HashMap<String, i64>,
    tp: HashMap<String, Timer>,
    changes: HashMap<String, Option<IoValue>>,
    started: Instant,
}

impl Cycletools {
    /// Fresh toolbox for a loop running at `cycle_time_ms`.
    pub fn new(cycle_time_ms: u32, image: ProcessImage) -> Self {
        Self {
            first: true,
            last: false,
            flag1c: false,
            flag5c: false,
            flag10c: false,
            flag15c: false,
            flag20c: false,
            flank5c: true,
            flank10c: true,
            flank15c: true,
            flank20c: true,
            image,
            cycle_time_ms: cycle_time_ms.max(1),
            cycle: 0,
            fives: 0,
            ton: HashMap::new(),
            tof: HashMap::new(),
            tp: HashMap::new(),
            changes: HashMap::new(),
            started: Instant::now(),
        }
    }

    /// The process image the loop runs on.
    pub fn image(&self) -> &ProcessImage {
        &self.image
    }

    /// Milliseconds since the cycle function was entered.
    pub fn runtime(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn cycles(&self, ms: u32) -> i64 {
        ms.div_ceil(self.cycle_time_ms) as i64
    }

    pub(crate) fn begin_cycle(&mut self, last: bool) {
        self.started = Instant::now();
        self.last = last;
    }

    /// Advance timers and flags after the cycle function returned.
    pub(crate) fn end_cycle(&mut self) {
        for remaining in self.tof.values_mut() {
            if *remaining > 0 {
                *remaining -= 1;
            }
        }
        for timer in self.ton.values_mut() {
            if timer.armed {
                if timer.remaining > 0 {
                    timer.remaining -= 1;
                }
                timer.armed = false;
            } else {
                timer.remaining = -1;
            }
        }
        for timer in self.tp.values_mut() {
            if timer.armed {
                if timer.remaining > 0 {
                    timer.remaining -= 1;
                } else {
                    timer.armed = false;
                }
            } else {
                timer.remaining = -1;
            }
        }

        self.flank5c = false;
        self.flank10c = false;
        self.flank15c = false;
        self.flank20c = false;
        self.first = false;
        self.flag1c = !self.flag1c;

        self.cycle += 1;
        if self.cycle == 5 {
            self.fives += 1;
            if self.fives == 3 {
                self.flank15c = true;
                self.flag15c = !self.flag15c;
                self.fives = 0;
            }
            if self.flag5c {
                if self.flag10c {
                    self.flank20c = true;
                    self.flag20c = !self.flag20c;
                }
                self.flank10c = true;
                self.flag10c = !self.flag10c;
            }
            self.flank5c = true;
            self.flag5c = !self.flag5c;
            self.cycle = 0;
        }

        let names: Vec<String> = self.changes.keys().cloned().collect();
        for name in names {
            let value = self.image.io(&name).and_then(|io| io.value()).ok();
            self.changes.insert(name, value);
        }
    }

    /// True if `io` changed since the previous cycle.
    ///
    /// The first call for an IO only starts tracking and returns false.
    pub fn changed(&mut self, io: &IoHandle, edge: Edge) -> SyncResult<bool> {
        let Some(previous) = self.changes.get(io.name()) else {
            if edge != Edge::Both && !io.descriptor()?.is_bit() {
                return Err(SyncError::InvalidEdge(io.name().to_string()));
            }
            self.changes.insert(io.name().to_string(), None);
            return Ok(false);
        };
        let value = io.value()?;
        if previous.as_ref() == Some(&value) {
            return Ok(false);
        }
        Ok(match edge {
            Edge::Both => true,
            Edge::Rising => value.truthy(),
            Edge::Falling => !value.truthy(),
        })
    }

    // ─── TOF ────────────────────────────────────────────────────────

    /// Off-delay output: true while the delay runs.
    pub fn get_tof(&self, name: &str) -> bool {
        self.tof.get(name).is_some_and(|&c| c > 0)
    }

    /// Same as [`get_tof`](Self::get_tof).
    pub fn get_tofc(&self, name: &str) -> bool {
        self.get_tof(name)
    }

    /// (Re)start an off-delay of `ms` milliseconds.
    pub fn set_tof(&mut self, name: &str, ms: u32) {
        let cycles = self.cycles(ms);
        self.tof.insert(name.to_string(), cycles);
    }

    /// (Re)start an off-delay of `cycles` cycles.
    pub fn set_tofc(&mut self, name: &str, cycles: u32) {
        self.tof.insert(name.to_string(), cycles as i64);
    }

    // ─── TON ────────────────────────────────────────────────────────

    /// On-delay output: true once the delay elapsed.
    pub fn get_ton(&self, name: &str) -> bool {
        self.ton.get(name).is_some_and(|t| t.remaining == 0)
    }

    /// Same as [`get_ton`](Self::get_ton).
    pub fn get_tonc(&self, name: &str) -> bool {
        self.get_ton(name)
    }

    /// Keep an on-delay of `ms` milliseconds running.
    pub fn set_ton(&mut self, name: &str, ms: u32) {
        let cycles = self.cycles(ms);
        arm(&mut self.ton, name, cycles);
    }

    /// Keep an on-delay of `cycles` cycles running.
    pub fn set_tonc(&mut self, name: &str, cycles: u32) {
        arm(&mut self.ton, name, cycles as i64);
    }

    // ─── TP ─────────────────────────────────────────────────────────

    /// Pulse output: true while the pulse runs.
    pub fn get_tp(&self, name: &str) -> bool {
        self.tp.get(name).is_some_and(|t| t.remaining > 0)
    }

    /// Same as [`get_tp`](Self::get_tp).
    pub fn get_tpc(&self, name: &str) -> bool {
        self.get_tp(name)
    }

    /// Start a pulse of `ms` milliseconds.
    pub fn set_tp(&mut self, name: &str, ms: u32) {
        let cycles = self.cycles(ms);
        arm(&mut self.tp, name, cycles);
    }

    /// Start a pulse of `cycles` cycles.
    pub fn set_tpc(&mut self, name: &str, cycles: u32) {
        arm(&mut self.tp, name, cycles as i64);
    }
}

/// Start an idle timer or mark a running one as called in this cycle.
fn arm(timers: &mut HashMap<String, Timer>, name: &str, cycles: i64) {
    match timers.get_mut(name) {
        Some(timer) if timer.remaining != -1 => timer.armed = true,
        _ => {
            timers.insert(
                name.to_string(),
                Timer {
                    remaining: cycles,
                    armed: true,
                },
            );
        }
    }
}
