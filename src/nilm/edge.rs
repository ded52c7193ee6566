//! Step detection against an adaptive baseline.
//!
//! The delta is measured from the newest *raw* reading, because the moving average
//! lags during a transition and would under-report the step. Smoothing only feeds
//! the slow drift of the baseline while the load is stable.

use chrono::{DateTime, Utc};

use crate::config::NilmConfig;
use crate::db::models::{EventKind, Leg};
use crate::nilm::smoothing::DetectorState;
use crate::utils::round_to;

/// Weight kept by the baseline on each stable sample.
const BASELINE_RETENTION: f64 = 0.95;
/// Legs closer than this are reported as "both".
const LEG_BALANCE_W: f64 = 20.0;
/// Step size at which confidence saturates, scaled from 0.5.
const CONFIDENCE_SCALE_W: f64 = 400.0;

/// An accepted step change, before it is matched or persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub kind: EventKind,
    /// Absolute step, one decimal.
    pub power_delta: f64,
    pub leg: Leg,
    pub confidence: f64,
    /// Raw reading that becomes the new baseline once the edge is recorded.
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeDecision {
    /// First call: the baseline starts at the smoothed value.
    Seed(f64),
    /// Below threshold: the baseline drifts to this value.
    Stable(f64),
    /// Large enough but too close to the previous accepted edge.
    Debounced,
    Accepted(Edge),
}

/// Decide what the newest reading means without touching the state.
pub fn evaluate(
    state: &DetectorState,
    smoothed: f64,
    leg1: Option<f64>,
    leg2: Option<f64>,
    at: DateTime<Utc>,
    cfg: &NilmConfig,
) -> EdgeDecision {
    let Some(baseline) = state.baseline else {
        return EdgeDecision::Seed(smoothed);
    };

    let raw = state.total.latest().unwrap_or(smoothed);
    let delta = raw - baseline;

    if delta.abs() < cfg.edge_threshold_w {
        return EdgeDecision::Stable(baseline * BASELINE_RETENTION + smoothed * (1.0 - BASELINE_RETENTION));
    }

    if let Some(last) = state.last_event_at {
        let elapsed = (at - last).num_milliseconds() as f64 / 1000.0;
        if elapsed < cfg.debounce_secs {
            return EdgeDecision::Debounced;
        }
    }

    let power_delta = round_to(delta.abs(), 1);
    EdgeDecision::Accepted(Edge {
        kind: if delta > 0.0 { EventKind::On } else { EventKind::Off },
        power_delta,
        leg: classify_leg(leg1, leg2),
        confidence: confidence(power_delta),
        level: raw,
    })
}

pub fn classify_leg(leg1: Option<f64>, leg2: Option<f64>) -> Leg {
    let l1 = leg1.unwrap_or(0.0);
    let l2 = leg2.unwrap_or(0.0);
    if (l1 - l2).abs() < LEG_BALANCE_W {
        Leg::Both
    } else if l1 > l2 {
        Leg::L1
    } else {
        Leg::L2
    }
}

/// Larger steps are less likely to be noise: 0.5 at zero, 1.0 from 200 W up.
pub fn confidence(power_delta: f64) -> f64 {
    round_to((0.5 + power_delta / CONFIDENCE_SCALE_W).clamp(0.5, 1.0), 2)
}
