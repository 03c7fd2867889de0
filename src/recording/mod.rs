// Recording data model
// Channels, epochs, sweeps, and recording-shape normalization

use serde::{Deserialize, Serialize};

/// A named, uniformly sampled time series within a sweep
/// Owned externally; the detection core only slices it, never mutates it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Channel identifier (e.g., "ImRight", "Vm0")
    pub id: String,

    /// Sample values in physical units
    pub samples: Vec<f32>,

    /// Sampling rate in Hz
    pub sample_rate_hz: f64,

    /// Physical units of the samples (e.g., "pA", "mV")
    pub units: String,

    /// Set by the preprocessor once filtering has been applied
    /// A filtered slice is never filtered a second time
    pub filtered: bool,
}

impl Channel {
    /// Create a new unfiltered channel
    pub fn new(id: impl Into<String>, samples: Vec<f32>, sample_rate_hz: f64, units: impl Into<String>) -> Self {
        Channel {
            id: id.into(),
            samples,
            sample_rate_hz,
            units: units.into(),
            filtered: false,
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the channel holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate_hz <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate_hz
    }

    /// Convert a time in milliseconds to the nearest sample index (clamped)
    pub fn index_at_ms(&self, t_ms: f64) -> usize {
        if self.sample_rate_hz <= 0.0 || self.samples.is_empty() {
            return 0;
        }
        let idx = (t_ms / 1000.0 * self.sample_rate_hz).round();
        (idx.max(0.0) as usize).min(self.samples.len())
    }

    /// Convert a sample index to its time in milliseconds
    pub fn ms_at_index(&self, index: usize) -> f64 {
        if self.sample_rate_hz <= 0.0 {
            return 0.0;
        }
        index as f64 * 1000.0 / self.sample_rate_hz
    }

    /// Slice the channel over `[t_start_ms, t_stop_ms)`
    /// Returns a new, independent channel; bounds are clamped to the data
    pub fn slice(&self, t_start_ms: f64, t_stop_ms: f64) -> Channel {
        let start = self.index_at_ms(t_start_ms);
        let stop = self.index_at_ms(t_stop_ms).max(start);
        Channel {
            id: self.id.clone(),
            samples: self.samples[start..stop].to_vec(),
            sample_rate_hz: self.sample_rate_hz,
            units: self.units.clone(),
            filtered: self.filtered,
        }
    }
}

/// A named sub-interval of a sweep's time axis
/// Used to restrict detection to a region of interest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub name: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

impl Epoch {
    pub fn new(name: impl Into<String>, start_ms: f64, end_ms: f64) -> Self {
        Epoch {
            name: name.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        (self.end_ms - self.start_ms).max(0.0)
    }
}

/// One trial/trace within a multi-trial recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    /// Named time series recorded during this trial
    pub channels: Vec<Channel>,

    /// Optional detection regions; empty means detect over the whole channel
    pub epochs: Vec<Epoch>,

    /// Index of the currently-selected detection channel
    /// `None` means no signal has been selected
    pub active_channel: Option<usize>,
}

impl Sweep {
    /// Create a sweep with a single channel, selected for detection
    pub fn single_channel(channel: Channel) -> Self {
        Sweep {
            channels: vec![channel],
            epochs: Vec::new(),
            active_channel: Some(0),
        }
    }

    /// The currently-selected detection channel, if any
    pub fn active_channel(&self) -> Option<&Channel> {
        self.active_channel.and_then(|i| self.channels.get(i))
    }

    /// Select the detection channel by id; returns false if no such channel
    pub fn select_channel(&mut self, id: &str) -> bool {
        match self.channels.iter().position(|c| c.id == id) {
            Some(i) => {
                self.active_channel = Some(i);
                true
            }
            None => false,
        }
    }
}

/// Shape of recording data as handed over by the acquisition layer
/// Normalized into a uniform sweep sequence at the boundary
#[derive(Debug, Clone)]
pub enum RecordingShape {
    /// A single continuous trace
    Single(Sweep),
    /// An ordered series of trials
    Many(Vec<Sweep>),
}

/// An ordered sequence of sweeps
/// Sweep index is the identity key used throughout the detection core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub sweeps: Vec<Sweep>,
}

impl Recording {
    pub fn new(sweeps: Vec<Sweep>) -> Self {
        Recording { sweeps }
    }

    /// Number of sweeps
    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    /// True if the recording holds no sweeps
    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    /// Sweep by index
    pub fn sweep(&self, index: usize) -> Option<&Sweep> {
        self.sweeps.get(index)
    }
}

impl From<RecordingShape> for Recording {
    fn from(shape: RecordingShape) -> Self {
        match shape {
            RecordingShape::Single(sweep) => Recording { sweeps: vec![sweep] },
            RecordingShape::Many(sweeps) => Recording { sweeps },
        }
    }
}
