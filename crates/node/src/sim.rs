//! Stateful greenhouse telemetry simulator for local development.
//!
//! Models plausible sensor behaviour per plant profile:
//! - Temporal coherence via random walk with mean reversion
//! - Slow drying drift on the moisture channel (evaporation)
//! - Per-reading noise
//! - Closed-loop pump response (moisture rises while the pump runs)
//! - Gradual battery drain

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Plant profiles
// ---------------------------------------------------------------------------

/// Pre-configured plant profiles selectable via `SIM_PROFILE` env var.
/// Ranges follow the dashboard's demo plant library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Thirsty crop, mid-range everything. Default.
    Tomato,
    /// Cool and damp; rarely triggers alerts.
    Lettuce,
    /// Drought-tolerant succulent living near the low-moisture threshold.
    /// Good for exercising advisory and auto-pump paths.
    Aloe,
}

impl Profile {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "lettuce" => Self::Lettuce,
            "aloe" => Self::Aloe,
            _ => Self::Tomato, // default
        }
    }

    /// (typical, min, max) per channel.
    fn moisture(self) -> (f64, f64, f64) {
        match self {
            Self::Tomato => (65.0, 55.0, 80.0),
            Self::Lettuce => (72.0, 60.0, 85.0),
            Self::Aloe => (18.0, 8.0, 30.0),
        }
    }

    fn temperature(self) -> (f64, f64, f64) {
        match self {
            Self::Tomato => (25.0, 20.0, 30.0),
            Self::Lettuce => (19.0, 15.0, 24.0),
            Self::Aloe => (26.0, 18.0, 32.0),
        }
    }

    fn humidity(self) -> (f64, f64, f64) {
        match self {
            Self::Tomato => (60.0, 50.0, 70.0),
            Self::Lettuce => (65.0, 55.0, 75.0),
            Self::Aloe => (32.0, 20.0, 45.0),
        }
    }

    fn light(self) -> (f64, f64, f64) {
        match self {
            Self::Tomato => (700.0, 500.0, 900.0),
            Self::Lettuce => (450.0, 300.0, 600.0),
            Self::Aloe => (800.0, 600.0, 1000.0),
        }
    }

    fn battery(self) -> (f64, f64, f64) {
        match self {
            Self::Tomato => (88.0, 70.0, 100.0),
            Self::Lettuce => (82.0, 60.0, 95.0),
            Self::Aloe => (74.0, 50.0, 90.0),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tomato => write!(f, "tomato"),
            Self::Lettuce => write!(f, "lettuce"),
            Self::Aloe => write!(f, "aloe"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

struct ChannelState {
    value: f64,
    center: f64,
    min: f64,
    max: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    mean_reversion: f64,
}

impl ChannelState {
    fn new((typical, min, max): (f64, f64, f64)) -> Self {
        let range = max - min;
        Self {
            value: typical + gaussian(0.0, range * 0.05),
            center: typical,
            min,
            max,
            walk_sigma: range * 0.02,
            noise_sigma: range * 0.015,
            mean_reversion: 0.05,
        }
    }

    /// Evolve the underlying value and return an instantaneous reading.
    fn sample(&mut self, extra_drift: f64) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk + extra_drift).clamp(self.min, self.max);
        (self.value + gaussian(0.0, self.noise_sigma)).clamp(self.min, self.max)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One snapshot of all sensor channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub light: f64,
    pub battery: f64,
}

pub struct GreenhouseSim {
    moisture: ChannelState,
    temperature: ChannelState,
    humidity: ChannelState,
    light: ChannelState,
    battery: ChannelState,
    pump_on: bool,
    /// Moisture gained per tick while the pump runs.
    wet_rate: f64,
    /// Moisture lost per tick to evaporation.
    dry_rate: f64,
    /// Battery drained per tick.
    drain_rate: f64,
}

impl GreenhouseSim {
    pub fn new(profile: Profile) -> Self {
        let mut moisture = ChannelState::new(profile.moisture());
        // Moisture is not mean-reverting: it dries until watered.
        moisture.mean_reversion = 0.0;
        Self {
            moisture,
            temperature: ChannelState::new(profile.temperature()),
            humidity: ChannelState::new(profile.humidity()),
            light: ChannelState::new(profile.light()),
            battery: ChannelState::new(profile.battery()),
            pump_on: false,
            wet_rate: 1.5,
            dry_rate: 0.08,
            drain_rate: 0.01,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    /// Produce the next snapshot. Call once per sampling tick — the
    /// internal state evolves with every call.
    pub fn tick(&mut self) -> Snapshot {
        let moisture_drift = if self.pump_on {
            self.wet_rate
        } else {
            -self.dry_rate
        };
        Snapshot {
            moisture: self.moisture.sample(moisture_drift),
            temperature: self.temperature.sample(0.0),
            humidity: self.humidity.sample(0.0),
            light: self.light.sample(0.0),
            battery: self.battery.sample(-self.drain_rate),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
