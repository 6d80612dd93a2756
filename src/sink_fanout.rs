// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use log::{debug, info, warn};

use crate::imu_trait::Reading;

/// A destination for Readings: file, network, display.
pub trait Sink: Send {
    fn name(&self) -> &str;

    // Called on the scheduler thread once per tick. Must return promptly:
    // anything that can stall (network I/O) belongs behind a queue.
    fn deliver(&mut self, reading: &Reading) -> Result<(), CanonicalError>;

    // Flushes and releases the sink. Called once, at the end of the session.
    fn close(&mut self) -> Result<(), CanonicalError> {
        Ok(())
    }

    // Readings accepted by deliver() but discarded afterwards, e.g. because a
    // best-effort queue was full.
    fn dropped(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkDeliveryStats {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub last_error: Option<String>,
}

struct RegisteredSink {
    sink: Box<dyn Sink>,
    delivered: u64,
    failed: u64,
    last_error: Option<String>,
}

// Hands each Reading to every registered sink. A sink that fails is logged
// and counted but neither stops delivery to the other sinks nor surfaces an
// error to the caller. Only the first failure of each sink is logged above
// debug level; totals are available from summary().
pub struct SinkFanout {
    sinks: Vec<RegisteredSink>,
}

impl SinkFanout {
    pub fn new() -> Self {
        SinkFanout{sinks: Vec::new()}
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        info!("Registered sink {}", sink.name());
        self.sinks.push(RegisteredSink{sink, delivered: 0, failed: 0, last_error: None});
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn publish(&mut self, reading: &Reading) {
        for registered in &mut self.sinks {
            match registered.sink.deliver(reading) {
                Ok(()) => registered.delivered += 1,
                Err(e) => {
                    if registered.failed == 0 {
                        warn!("Sink {} failed: {:?} (further failures logged at debug)",
                              registered.sink.name(), e);
                    } else {
                        debug!("Sink {} failed: {:?}", registered.sink.name(), e);
                    }
                    registered.failed += 1;
                    registered.last_error = Some(e.message);
                },
            }
        }
    }

    // Closes every sink, even if closing an earlier one fails.
    pub fn close(&mut self) {
        for registered in &mut self.sinks {
            if let Err(e) = registered.sink.close() {
                warn!("Error closing sink {}: {:?}", registered.sink.name(), e);
                registered.last_error = Some(e.message);
            }
        }
    }

    pub fn summary(&self) -> Vec<SinkDeliveryStats> {
        self.sinks.iter().map(|registered| SinkDeliveryStats{
            name: registered.sink.name().to_string(),
            delivered: registered.delivered,
            failed: registered.failed,
            dropped: registered.sink.dropped(),
            last_error: registered.last_error.clone(),
        }).collect()
    }
}

impl Default for SinkFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use canonical_error::internal_error;
    use crate::imu_trait::{AccelData, GyroData, MagData, Orientation,
                           Quaternion, Sample};
    use super::*;

    struct RecordingSink {
        received: Arc<Mutex<Vec<i64>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn deliver(&mut self, reading: &Reading) -> Result<(), CanonicalError> {
            self.received.lock().unwrap().push(reading.sample.time_ms);
            Ok(())
        }

        fn close(&mut self) -> Result<(), CanonicalError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&mut self, _reading: &Reading) -> Result<(), CanonicalError> {
            Err(internal_error("disk full"))
        }

        fn close(&mut self) -> Result<(), CanonicalError> {
            Err(internal_error("close failed"))
        }
    }

    fn reading(time_ms: i64) -> Reading {
        Reading {
            sample: Sample {
                dev_id: "dev".to_string(),
                time_ms,
                accel: AccelData::default(),
                gyro: GyroData::default(),
                mag: MagData::default(),
                quaternion: Quaternion::identity(),
            },
            orientation: Orientation::default(),
        }
    }

    #[test]
    fn test_failing_sink_does_not_block_healthy_sink() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let mut fanout = SinkFanout::new();
        // Failing sink registered first, so it is tried before the healthy one.
        fanout.add_sink(Box::new(FailingSink));
        fanout.add_sink(Box::new(RecordingSink{received: received.clone(),
                                               closed: closed.clone()}));
        assert_eq!(fanout.len(), 2);

        for t in 0..3 {
            fanout.publish(&reading(t));
        }
        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2]);

        fanout.close();
        assert!(*closed.lock().unwrap());

        let summary = fanout.summary();
        assert_eq!(summary[0].name, "failing");
        assert_eq!(summary[0].delivered, 0);
        assert_eq!(summary[0].failed, 3);
        assert_eq!(summary[0].last_error.as_deref(), Some("close failed"));
        assert_eq!(summary[1].name, "recording");
        assert_eq!(summary[1].delivered, 3);
        assert_eq!(summary[1].failed, 0);
        assert_eq!(summary[1].last_error, None);
    }

    #[test]
    fn test_empty_fanout() {
        let mut fanout = SinkFanout::new();
        assert!(fanout.is_empty());
        fanout.publish(&reading(1));
        fanout.close();
        assert!(fanout.summary().is_empty());
    }

}  // mod tests.
