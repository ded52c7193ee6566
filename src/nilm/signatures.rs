//! Online clustering of step sizes into appliance signatures.
//!
//! Greedy nearest match inside a band relative to each signature's average, since
//! larger appliances carry proportionally more measurement noise.

use log::info;
use std::collections::BTreeMap;

use crate::config::NilmConfig;
use crate::db::models::{Leg, NewSignature, Signature};
use crate::db::store::{Store, StoreError};
use crate::utils::round_to;

/// Placeholder presentation picked from the power magnitude alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appearance {
    pub label: &'static str,
    pub icon: &'static str,
    pub color: &'static str,
}

/// Upper bound (exclusive) in watts, and what to show below it.
const APPEARANCE_BANDS: [(f64, Appearance); 4] = [
    (
        50.0,
        Appearance {
            label: "Small Device",
            icon: "\u{1F50C}",
            color: "#60a5fa",
        },
    ),
    (
        200.0,
        Appearance {
            label: "Medium Device",
            icon: "\u{2744}\u{FE0F}",
            color: "#22c55e",
        },
    ),
    (
        800.0,
        Appearance {
            label: "Appliance",
            icon: "\u{1F4FA}",
            color: "#f59e0b",
        },
    ),
    (
        2000.0,
        Appearance {
            label: "Heater/Cooler",
            icon: "\u{1F525}",
            color: "#ef4444",
        },
    ),
];

const MAJOR_APPLIANCE: Appearance = Appearance {
    label: "Major Appliance",
    icon: "\u{26A1}",
    color: "#a855f7",
};

pub fn suggest_appearance(power: f64) -> Appearance {
    let p = power.abs();
    APPEARANCE_BANDS
        .iter()
        .find(|(upper, _)| p < *upper)
        .map(|(_, appearance)| *appearance)
        .unwrap_or(MAJOR_APPLIANCE)
}

/// True for the generated placeholder labels, i.e. labels nobody chose.
pub fn is_auto_label(label: &str) -> bool {
    label == MAJOR_APPLIANCE.label || APPEARANCE_BANDS.iter().any(|(_, a)| a.label == label)
}

/// The closest signature whose average is within `tolerance` (relative) of
/// `power_delta`. Exact ties prefer a signature seen on the same leg.
pub fn find_matching_signature<'a>(
    signatures: &'a [Signature],
    power_delta: f64,
    leg: Leg,
    tolerance: f64,
) -> Option<&'a Signature> {
    let mut best: Option<(&Signature, f64)> = None;
    for sig in signatures {
        let diff = (power_delta - sig.power_avg).abs();
        if diff > sig.power_avg * tolerance {
            continue;
        }
        best = match best {
            None => Some((sig, diff)),
            Some((_, best_diff)) if diff < best_diff => Some((sig, diff)),
            Some((current, best_diff)) if diff == best_diff && current.leg_pattern != leg && sig.leg_pattern == leg => {
                Some((sig, diff))
            }
            keep => keep,
        };
    }
    best.map(|(sig, _)| sig)
}

/// Fold another observation into the running statistics.
pub fn absorb(sig: &mut Signature, power_delta: f64) {
    let count = sig.event_count.max(0) as f64;
    sig.power_avg = round_to((sig.power_avg * count + power_delta) / (count + 1.0), 1);
    sig.power_min = sig.power_min.min(power_delta);
    sig.power_max = sig.power_max.max(power_delta);
    sig.event_count += 1;
}

pub fn new_signature(power_delta: f64, leg: Leg) -> NewSignature {
    let appearance = suggest_appearance(power_delta);
    NewSignature {
        power_avg: power_delta,
        power_min: power_delta,
        power_max: power_delta,
        leg_pattern: leg,
        event_count: 1,
        user_label: appearance.label.to_string(),
        icon: appearance.icon.to_string(),
        color: appearance.color.to_string(),
        is_active: false,
        active_count: 0,
        last_on_time: None,
        avg_duration: 0.0,
        daily_cycles: 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customization {
    pub label: String,
    pub icon: String,
    pub color: String,
}

/// User edits captured before a reanalysis, keyed by rounded average power.
#[derive(Debug, Clone, Default)]
pub struct LabelRestoreTable {
    entries: BTreeMap<i64, Customization>,
}

impl LabelRestoreTable {
    /// Keep only signatures whose label is not a generated placeholder.
    pub fn capture(signatures: &[Signature]) -> Self {
        let entries = signatures
            .iter()
            .filter(|sig| !is_auto_label(&sig.user_label))
            .map(|sig| {
                (
                    sig.power_avg.round() as i64,
                    Customization {
                        label: sig.user_label.clone(),
                        icon: sig.icon.clone(),
                        color: sig.color.clone(),
                    },
                )
            })
            .collect();
        LabelRestoreTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest saved customization within `max(power × tolerance, edge threshold)`.
    pub fn lookup(&self, power_avg: f64, cfg: &NilmConfig) -> Option<&Customization> {
        let key = power_avg.round();
        let band = (key * cfg.signature_tolerance).max(cfg.edge_threshold_w);
        self.entries
            .iter()
            .map(|(saved, custom)| ((key - *saved as f64).abs(), custom))
            .filter(|(diff, _)| *diff <= band)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, custom)| custom)
    }

    /// Overwrite the presentation of every rebuilt signature that has a saved match.
    pub fn apply<S: Store>(&self, store: &S, cfg: &NilmConfig) -> Result<usize, StoreError> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let mut restored = 0;
        for mut sig in store.list_signatures()? {
            let Some(custom) = self.lookup(sig.power_avg, cfg) else {
                continue;
            };
            sig.user_label = custom.label.clone();
            sig.icon = custom.icon.clone();
            sig.color = custom.color.clone();
            store.update_signature(&sig)?;
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {} custom appliance name(s) from before reanalysis", restored);
        }
        Ok(restored)
    }
}
