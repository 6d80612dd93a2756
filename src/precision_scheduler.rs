// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{debug, info, warn};

use crate::value_stats::ValueStatsAccumulator;

// Number of most recent tick intervals kept for the "recent" statistics.
const RECENT_TICKS: usize = 100;

/// Time source for the scheduler. Must be monotonic: wall clock adjustments
/// must never perturb the sampling cadence.
pub trait Clock {
    // Time elapsed since some fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock{origin: Instant::now()}
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct SchedulerStats {
    pub ticks: u64,

    // Ticks whose work ran past the tick's deadline.
    pub overruns: u64,

    // Deadlines passed over entirely because a tick ran longer than a full
    // period. These ticks are not made up.
    pub skipped_deadlines: u64,

    // Milliseconds between the starts of successive ticks.
    pub tick_interval_ms: ValueStatsAccumulator,

    // Time from start of run to its return.
    pub elapsed: Duration,
}

impl SchedulerStats {
    fn new() -> Self {
        SchedulerStats {
            ticks: 0,
            overruns: 0,
            skipped_deadlines: 0,
            tick_interval_ms: ValueStatsAccumulator::new(RECENT_TICKS),
            elapsed: Duration::ZERO,
        }
    }
}

// Runs a unit of work once per period. Deadlines are laid on a fixed grid
// (start + k * period) rather than being computed from the end of the
// previous tick, so time spent doing the work does not accumulate as drift.
//
// When a tick overruns its deadline, the next tick starts immediately. If
// the overrun spans one or more whole periods, the deadlines that were
// passed over are dropped rather than run back to back.
pub struct PrecisionScheduler<C: Clock = MonotonicClock> {
    period: Duration,
    clock: C,

    // If set, run_ticks() returns after this many ticks.
    max_ticks: Option<u64>,

    stats: SchedulerStats,
}

impl PrecisionScheduler<MonotonicClock> {
    pub fn new(period: Duration) -> Result<Self, CanonicalError> {
        Self::with_clock(period, MonotonicClock::new())
    }

    // `period_ms` must be positive.
    pub fn from_millis(period_ms: i64) -> Result<Self, CanonicalError> {
        if period_ms <= 0 {
            return Err(invalid_argument_error(
                &format!("Scheduler period must be positive, got {}ms", period_ms)));
        }
        Self::new(Duration::from_millis(period_ms as u64))
    }
}

impl<C: Clock> PrecisionScheduler<C> {
    pub fn with_clock(period: Duration, clock: C) -> Result<Self, CanonicalError> {
        if period.is_zero() {
            return Err(invalid_argument_error("Scheduler period must be positive"));
        }
        Ok(PrecisionScheduler{period, clock, max_ticks: None, stats: SchedulerStats::new()})
    }

    pub fn set_max_ticks(&mut self, max_ticks: Option<u64>) {
        self.max_ticks = max_ticks;
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Calls `tick` once per period until `got_signal` is set, `max_ticks`
    /// is reached, or `tick` returns an error. The stop signal is checked
    /// once per tick. An error from `tick` ends the run and is returned;
    /// stats() remains valid either way.
    pub fn run_ticks<F>(&mut self, got_signal: &AtomicBool, mut tick: F)
                        -> Result<(), CanonicalError>
    where F: FnMut() -> Result<(), CanonicalError>
    {
        info!("Running at {:?} period", self.period);
        let start = self.clock.now();
        let mut next_deadline = start + self.period;
        let mut last_tick_start: Option<Duration> = None;
        let result = loop {
            if got_signal.load(Ordering::Relaxed) {
                info!("Stop requested after {} ticks", self.stats.ticks);
                break Ok(());
            }
            if let Some(max_ticks) = self.max_ticks {
                if self.stats.ticks >= max_ticks {
                    break Ok(());
                }
            }
            let tick_start = self.clock.now();
            if let Some(last) = last_tick_start {
                self.stats.tick_interval_ms.add_value(
                    (tick_start - last).as_secs_f64() * 1000.0);
            }
            last_tick_start = Some(tick_start);

            self.stats.ticks += 1;
            if let Err(e) = tick() {
                break Err(e);
            }

            let now = self.clock.now();
            if now < next_deadline {
                self.clock.sleep(next_deadline - now);
            } else {
                if self.stats.overruns == 0 {
                    warn!("Tick {} overran its deadline by {:?}",
                          self.stats.ticks, now - next_deadline);
                } else {
                    debug!("Tick {} overran its deadline by {:?}",
                           self.stats.ticks, now - next_deadline);
                }
                self.stats.overruns += 1;
            }
            next_deadline += self.period;
            while next_deadline <= now {
                next_deadline += self.period;
                self.stats.skipped_deadlines += 1;
            }
        };
        self.stats.elapsed = self.clock.now() - start;
        result
    }
}

// mod tests.
