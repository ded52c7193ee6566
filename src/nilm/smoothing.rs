//! Rolling windows and the detector's mutable state.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Fixed-capacity window of the most recent readings of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingWindow {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Arithmetic mean, or 0 for an empty window.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Change capacity, dropping the oldest readings if the window shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }
}

/// Everything the detector remembers between samples. Owned by the engine's writer
/// lock and replaced wholesale when a reanalysis starts.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorState {
    pub total: RollingWindow,
    pub leg1: RollingWindow,
    pub leg2: RollingWindow,
    /// `None` until the first detection call seeds it.
    pub baseline: Option<f64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl DetectorState {
    pub fn new(window: usize) -> Self {
        DetectorState {
            total: RollingWindow::new(window),
            leg1: RollingWindow::new(window),
            leg2: RollingWindow::new(window),
            baseline: None,
            last_event_at: None,
        }
    }

    /// Append one reading (absent legs count as 0) and return the smoothed total.
    pub fn push_reading(&mut self, total: f64, leg1: Option<f64>, leg2: Option<f64>) -> f64 {
        self.total.push(total);
        self.leg1.push(leg1.unwrap_or(0.0));
        self.leg2.push(leg2.unwrap_or(0.0));
        self.total.mean()
    }

    pub fn resize(&mut self, window: usize) {
        self.total.resize(window);
        self.leg1.resize(window);
        self.leg2.resize(window);
    }
}
