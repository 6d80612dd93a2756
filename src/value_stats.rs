// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;
use rolling_stats;
use statistical;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    // Only maintained over the recent window.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

// Statistics over a stream of values (e.g. milliseconds between scheduler
// ticks), both over the last `capacity` values and over the whole session.
pub struct ValueStatsAccumulator {
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,
    count: u64,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: DescriptiveStats::default(),
            session: DescriptiveStats::default(),
            count: 0,
            circular_buffer: CircularBuffer::new(capacity.max(1)),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.count += 1;
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent = &mut self.recent;
        recent.min = recent_values.iter().copied().fold(f64::INFINITY, f64::min);
        recent.max = recent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        recent.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent.stddev = statistical::standard_deviation(
                recent_values, Some(recent.mean));
        }
        let median = recent_values.medf_unchecked();
        recent.median = Some(median);
        recent.median_absolute_deviation = Some(recent_values.madf(median));

        self.session.min = self.rolling_stats.min;
        self.session.max = self.rolling_stats.max;
        self.session.mean = self.rolling_stats.mean;
        self.session.stddev = self.rolling_stats.std_dev;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset_session(&mut self) {
        self.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
        self.count = 0;
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque or
// similar because we want a view of all elements as a single slice, and we
// don't care about their order.
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.data.capacity();
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

// mod tests.
