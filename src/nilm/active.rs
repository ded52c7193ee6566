//! Which appliances are running right now.
//!
//! Live state is kept two ways: a per-signature instance counter driven by events,
//! and the set of unresolved "on" events. The latter is reconciled against the real
//! load reading on read, because a missed "off" would otherwise leave a phantom
//! appliance on forever.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::NilmConfig;
use crate::db::models::{STALE_DURATION, Signature};
use crate::db::store::{Store, StoreError};
use crate::error::NilmError;
use crate::nilm::NilmEngine;

/// Claimed power may exceed observed appliance power by this factor...
const PRUNE_RELATIVE_MARGIN: f64 = 1.5;
/// ...plus this many watts before the oldest claims are dropped.
const PRUNE_ABSOLUTE_MARGIN_W: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAppliance {
    pub signature_id: i64,
    pub event_id: i64,
    /// The signature's average power.
    pub power: f64,
    pub label: String,
    pub icon: String,
    pub color: String,
    pub on_since: DateTime<Utc>,
    pub running_secs: i64,
}

pub fn mark_on(sig: &mut Signature, at: DateTime<Utc>) {
    sig.active_count += 1;
    sig.is_active = true;
    sig.last_on_time = Some(at);
}

/// Drop one running instance; returns false when there was none to drop.
pub fn release(sig: &mut Signature) -> bool {
    if sig.active_count <= 0 {
        sig.active_count = 0;
        sig.is_active = false;
        return false;
    }
    sig.active_count -= 1;
    sig.is_active = sig.active_count > 0;
    true
}

/// Which running instance an "off" step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    /// The step's own signature.
    Matched,
    /// Another active signature, already decremented, still to be written back.
    Other(Signature),
    Nothing,
}

/// Apply an "off" step. The matched signature is released first; if it had nothing
/// running, the first other active signature (by id) within
/// `max(avg × tolerance, edge threshold)` of the step is released instead.
/// Nothing is written here.
///
/// Both this fallback and load-based pruning can release the same appliance when
/// overlapping loads make the evidence ambiguous; first match wins.
pub fn release_off(cfg: &NilmConfig, matched: &mut Signature, others: &[Signature], power_delta: f64) -> Release {
    if release(matched) {
        return Release::Matched;
    }
    if power_delta <= 0.0 {
        return Release::Nothing;
    }
    for other in others.iter().filter(|s| s.id != matched.id && s.active_count > 0) {
        let band = (other.power_avg * cfg.signature_tolerance).max(cfg.edge_threshold_w);
        if (power_delta - other.power_avg).abs() <= band {
            let mut other = other.clone();
            release(&mut other);
            debug!(
                "Off step {}W released signature {} instead of {}",
                power_delta, other.id, matched.id
            );
            return Release::Other(other);
        }
    }
    Release::Nothing
}

/// How many of the oldest entries must go for the claimed power to fit the
/// observed appliance load (`current_total - idle`).
pub fn prune_count(claimed: &[f64], current_total: f64, idle_load: f64) -> usize {
    let observed = (current_total - idle_load).max(0.0);
    let limit = observed * PRUNE_RELATIVE_MARGIN + PRUNE_ABSOLUTE_MARGIN_W;
    let mut total: f64 = claimed.iter().sum();
    let mut pruned = 0;
    while pruned < claimed.len() && total > limit {
        total -= claimed[pruned];
        pruned += 1;
    }
    pruned
}

impl<S: Store> NilmEngine<S> {
    /// Currently running appliances, oldest first, after expiring stale claims and,
    /// when `current_total` is given, pruning claims the live load cannot support.
    pub fn active_appliances(&self, current_total: Option<f64>) -> Result<Vec<ActiveAppliance>, NilmError> {
        self.active_appliances_at(current_total, Utc::now())
    }

    pub fn active_appliances_at(
        &self,
        current_total: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActiveAppliance>, NilmError> {
        let cfg = self.config();
        // pruning rewrites events and counters; keep it out of the way of ingestion
        let _writer = self.lock_detector();

        let mut signatures: BTreeMap<i64, Signature> =
            self.store.list_signatures()?.into_iter().map(|s| (s.id, s)).collect();
        let stale_before = now - Duration::hours(cfg.stale_on_hours);

        let mut active = Vec::new();
        let mut expired = 0;
        for event in self.store.list_unresolved_on_events(None)? {
            if event.time < stale_before {
                self.retire(&mut signatures, event.id, event.signature_id)?;
                expired += 1;
                continue;
            }
            let Some(sig) = signatures.get(&event.signature_id) else {
                continue;
            };
            active.push(ActiveAppliance {
                signature_id: sig.id,
                event_id: event.id,
                power: sig.power_avg,
                label: sig.user_label.clone(),
                icon: sig.icon.clone(),
                color: sig.color.clone(),
                on_since: event.time,
                running_secs: (now - event.time).num_seconds().max(0),
            });
        }
        if expired > 0 {
            info!("Expired {} unpaired on-event(s) older than {}h", expired, cfg.stale_on_hours);
        }

        if let Some(total) = current_total
            && !active.is_empty()
        {
            let claimed: Vec<f64> = active.iter().map(|a| a.power).collect();
            let pruned = prune_count(&claimed, total, cfg.idle_load_w);
            if pruned > 0 {
                for entry in active.drain(..pruned) {
                    self.retire(&mut signatures, entry.event_id, entry.signature_id)?;
                }
                info!(
                    "Pruned {} stale appliance claim(s) not supported by a {}W load",
                    pruned, total
                );
            }
        }

        Ok(active)
    }

    /// Stamp an "on" event stale and release the instance it was holding.
    fn retire(
        &self,
        signatures: &mut BTreeMap<i64, Signature>,
        event_id: i64,
        signature_id: i64,
    ) -> Result<(), StoreError> {
        self.store.update_event_duration(event_id, STALE_DURATION)?;
        if let Some(sig) = signatures.get_mut(&signature_id)
            && release(sig)
        {
            self.store.update_signature(sig)?;
        }
        Ok(())
    }
}
