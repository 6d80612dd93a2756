// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use canonical_error::{CanonicalError, CanonicalErrorCode, invalid_argument_error};
use log::{debug, error, info, warn};

use crate::imu_trait::{Reading, SampleSource};
use crate::precision_scheduler::{Clock, PrecisionScheduler};
use crate::quaternion_converter::QuaternionConverter;
use crate::sink_fanout::{SinkDeliveryStats, SinkFanout};
use crate::value_stats::DescriptiveStats;

/// Acquisition parameters, validated before any device access.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    // Written as the first field of every record.
    pub dev_id: String,

    // Scheduler period.
    pub interval: Duration,

    // How often the device refreshes its reports. Must not exceed
    // `interval`, else successive polls return the same stale packet.
    pub report_interval: Duration,

    // Zero disables the converter memo.
    pub memo_capacity: usize,

    // Network publish queue length.
    pub queue_capacity: usize,

    // Free-text label added to every CSV row.
    pub label: Option<String>,

    // Stop after this many ticks; None runs until signalled.
    pub max_ticks: Option<u64>,
}

impl SessionConfig {
    pub fn new(dev_id: &str, interval_ms: i64, report_interval_ms: i64)
               -> Result<Self, CanonicalError> {
        if interval_ms <= 0 {
            return Err(invalid_argument_error(
                &format!("Interval must be positive, got {}ms", interval_ms)));
        }
        if report_interval_ms <= 0 {
            return Err(invalid_argument_error(
                &format!("Report interval must be positive, got {}ms",
                         report_interval_ms)));
        }
        let config = SessionConfig{
            dev_id: dev_id.to_string(),
            interval: Duration::from_millis(interval_ms as u64),
            report_interval: Duration::from_millis(report_interval_ms as u64),
            memo_capacity: 64,
            queue_capacity: 256,
            label: None,
            max_ticks: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.interval.is_zero() {
            return Err(invalid_argument_error("Interval must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(invalid_argument_error("Report interval must be positive"));
        }
        if self.report_interval > self.interval {
            return Err(invalid_argument_error(
                &format!("Report interval {:?} exceeds polling interval {:?}",
                         self.report_interval, self.interval)));
        }
        if self.dev_id.is_empty() {
            return Err(invalid_argument_error("Device id must not be empty"));
        }
        // dev_id is written unquoted.
        if self.dev_id.contains([',', '"', '\n', '\r']) {
            return Err(invalid_argument_error(
                &format!("Device id {:?} contains a reserved character", self.dev_id)));
        }
        if let Some(label) = &self.label {
            if label.contains(['\n', '\r']) {
                return Err(invalid_argument_error("Label must be a single line"));
            }
        }
        if self.queue_capacity == 0 {
            return Err(invalid_argument_error("Queue capacity must be positive"));
        }
        Ok(())
    }
}

/// The host name, used as the device id when none is given.
pub fn default_device_id() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Could not get host name: {:?}", e);
            "imu".to_string()
        },
    }
}

/// End-of-session report. Per-occurrence failures are only counted during
/// the session; this is where they are surfaced.
#[derive(Debug)]
pub struct SessionSummary {
    pub ticks: u64,
    pub overruns: u64,
    pub skipped_deadlines: u64,

    // Readings not produced because the device returned a zero quaternion.
    pub degenerate_quaternions: u64,

    // Milliseconds between successive tick starts.
    pub tick_interval_ms: DescriptiveStats,
    pub recent_tick_interval_ms: DescriptiveStats,

    pub elapsed: Duration,
    pub memo_hits: u64,
    pub sinks: Vec<SinkDeliveryStats>,

    // The error that ended the session, if it did not end by request.
    pub error: Option<CanonicalError>,
}

impl SessionSummary {
    pub fn log(&self) {
        info!("Session ran {} ticks in {:.3}s; {} overruns, {} skipped deadlines, \
               {} degenerate quaternions skipped, {} memo hits",
              self.ticks, self.elapsed.as_secs_f64(), self.overruns,
              self.skipped_deadlines, self.degenerate_quaternions, self.memo_hits);
        let t = &self.tick_interval_ms;
        info!("Tick interval ms: min {:.3} max {:.3} mean {:.3} stddev {:.3}",
              t.min, t.max, t.mean, t.stddev);
        let r = &self.recent_tick_interval_ms;
        if let (Some(median), Some(mad)) = (r.median, r.median_absolute_deviation) {
            info!("Recent tick interval ms: median {:.3} mad {:.3}", median, mad);
        }
        for sink in &self.sinks {
            match &sink.last_error {
                Some(last_error) => warn!(
                    "Sink {}: {} delivered, {} failed, {} dropped; last error: {}",
                    sink.name, sink.delivered, sink.failed, sink.dropped, last_error),
                None => info!("Sink {}: {} delivered, {} failed, {} dropped",
                              sink.name, sink.delivered, sink.failed, sink.dropped),
            }
        }
        if let Some(e) = &self.error {
            error!("Session ended by error: {:?}", e);
        }
    }
}

// One tick's worth of work: poll the source, convert its quaternion, hand
// the reading to the sinks.
pub struct AcquisitionSession<S: SampleSource> {
    source: S,
    converter: QuaternionConverter,
    fanout: SinkFanout,
    degenerate_quaternions: u64,
}

impl<S: SampleSource> AcquisitionSession<S> {
    pub fn new(config: &SessionConfig, source: S, fanout: SinkFanout) -> Self {
        info!("Acquiring from {} as {:?}", source.get_model(), config.dev_id);
        AcquisitionSession{
            source,
            converter: QuaternionConverter::new(config.memo_capacity),
            fanout,
            degenerate_quaternions: 0,
        }
    }

    /// Errors from the source are returned, ending the session. A zero
    /// quaternion (seen while the device boots) skips this tick's delivery.
    pub fn tick(&mut self) -> Result<(), CanonicalError> {
        let sample = self.source.poll()?;
        let orientation = match self.converter.convert(&sample.quaternion) {
            Ok(orientation) => orientation,
            Err(e) if e.code == CanonicalErrorCode::InvalidArgument => {
                if self.degenerate_quaternions == 0 {
                    warn!("Skipping reading at {}ms: {}", sample.time_ms, e.message);
                } else {
                    debug!("Skipping reading at {}ms: {}", sample.time_ms, e.message);
                }
                self.degenerate_quaternions += 1;
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        self.fanout.publish(&Reading{sample, orientation});
        Ok(())
    }

    /// Ticks until `got_signal` is set, the scheduler's tick limit is
    /// reached, or the source fails. Sinks are closed in every case.
    pub fn run<C: Clock>(mut self, scheduler: &mut PrecisionScheduler<C>,
                         got_signal: &AtomicBool) -> SessionSummary {
        let result = scheduler.run_ticks(got_signal, || self.tick());
        if let Err(e) = &result {
            error!("Acquisition stopped: {:?}", e);
        }
        self.fanout.close();

        let stats = scheduler.stats();
        SessionSummary{
            ticks: stats.ticks,
            overruns: stats.overruns,
            skipped_deadlines: stats.skipped_deadlines,
            degenerate_quaternions: self.degenerate_quaternions,
            tick_interval_ms: stats.tick_interval_ms.session.clone(),
            recent_tick_interval_ms: stats.tick_interval_ms.recent.clone(),
            elapsed: stats.elapsed,
            memo_hits: self.converter.memo_hits(),
            sinks: self.fanout.summary(),
            error: result.err(),
        }
    }
}

/// Validates `config` and runs a session on the monotonic clock.
pub fn run_session<S: SampleSource>(config: &SessionConfig, source: S,
                                    fanout: SinkFanout, got_signal: &AtomicBool)
                                    -> Result<SessionSummary, CanonicalError> {
    config.validate()?;
    let mut scheduler = PrecisionScheduler::new(config.interval)?;
    scheduler.set_max_ticks(config.max_ticks);
    let session = AcquisitionSession::new(config, source, fanout);
    Ok(session.run(&mut scheduler, got_signal))
}

// mod tests.
