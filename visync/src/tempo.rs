use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use log::{debug, trace};

/// MIDI clock runs at 24 pulses per quarter note.
pub const PULSES_PER_BEAT: u32 = 24;

const DEFAULT_BPM: f64 = 120.0;

/// Smallest window that is ever trusted for a rate estimate.
const MIN_WINDOW: usize = 4;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Samples required before the rate estimate is considered synced.
    pub min_samples: usize,
    /// Window capacity; older samples are trimmed beyond this.
    pub max_samples: usize,
    /// Gaps longer than this mean the clock stopped.
    pub reset_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            min_samples: 4 * PULSES_PER_BEAT as usize,
            max_samples: 16 * PULSES_PER_BEAT as usize,
            reset_timeout: Duration::from_secs(1),
        }
    }
}

/// Turns clock pulse arrivals into a pulse rate and a running pulse index.
///
/// The pulse index advances by exactly one per pulse. The first pulse after
/// a reset is pulse 0.
#[derive(Debug)]
pub struct TempoTracker {
    config: TrackerConfig,
    rate_hz: f64,
    pulse_index: u64,
    started: bool,
    synced: bool,
    last_ping: Option<Instant>,
    samples: VecDeque<Duration>,
    span: Duration,
}

impl TempoTracker {
    pub fn new(config: TrackerConfig) -> TempoTracker {
        let min_samples = config.min_samples.max(MIN_WINDOW);
        let config = TrackerConfig {
            min_samples,
            max_samples: config.max_samples.max(min_samples),
            reset_timeout: config.reset_timeout,
        };
        TempoTracker {
            samples: VecDeque::with_capacity(config.max_samples + 1),
            config,
            rate_hz: DEFAULT_BPM * PULSES_PER_BEAT as f64 / 60.0,
            pulse_index: 0,
            started: false,
            synced: false,
            last_ping: None,
            span: Duration::ZERO,
        }
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    pub fn bpm(&self) -> f64 {
        self.rate_hz * 60.0 / PULSES_PER_BEAT as f64
    }

    pub fn pulse_index(&self) -> u64 {
        self.pulse_index
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn ping(&mut self) -> f64 {
        self.ping_at(Instant::now())
    }

    /// Record a pulse arriving at `now`. Returns the number of pulses the
    /// gap since the previous pulse corresponds to at the current rate.
    pub fn ping_at(&mut self, now: Instant) -> f64 {
        let elapsed = self
            .last_ping
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);
        self.last_ping = Some(now);

        if elapsed > self.config.reset_timeout {
            debug!(target: "visync", "clock gap of {:?}, resetting sync", elapsed);
            self.reset();
        } else if elapsed > Duration::ZERO {
            self.push_sample(elapsed);
        }

        if self.started {
            self.pulse_index += 1;
        } else {
            self.started = true;
        }

        if self.samples.len() >= self.config.min_samples && self.span > Duration::ZERO {
            self.rate_hz = self.samples.len() as f64 / self.span.as_secs_f64();
            if !self.synced {
                debug!(target: "visync", "clock synced at {:.2} bpm", self.bpm());
            }
            self.synced = true;
        }

        let pulses = elapsed.as_secs_f64() * self.rate_hz;
        trace!(
            "pulse {} ({:.2} pulses since last)",
            self.pulse_index,
            pulses
        );
        pulses
    }

    /// Forget rate history and start counting pulses from zero.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.span = Duration::ZERO;
        self.synced = false;
        self.reset_pulse_index();
    }

    /// Restart pulse numbering without touching the rate estimate.
    pub fn reset_pulse_index(&mut self) {
        self.pulse_index = 0;
        self.started = false;
    }

    fn push_sample(&mut self, sample: Duration) {
        self.samples.push_back(sample);
        self.span += sample;
        while self.samples.len() > self.config.max_samples {
            if let Some(old) = self.samples.pop_front() {
                self.span -= old;
            }
        }
    }
}

impl Default for TempoTracker {
    fn default() -> TempoTracker {
        TempoTracker::new(TrackerConfig::default())
    }
}
