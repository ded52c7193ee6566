//! Appliance event detection on a whole-house load signal.
//!
//! [`NilmEngine`] owns the detector state and drives every sample through
//! ingestion, edge detection, signature matching, pairing, active-state tracking and
//! daily aggregation. Mutating entry points share one writer lock; the detector
//! state is only committed after the store accepted the corresponding writes.

pub mod active;
pub mod edge;
pub mod pairing;
pub mod replay;
pub mod signatures;
pub mod smoothing;
pub mod stats;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::NilmConfig;
use crate::db::models::{DailyStat, EventKind, LoadEvent, LoadSample, NewLoadEvent, NewSignature, Signature};
use crate::db::store::{EdgeWrite, SignatureWrite, Store, StoreError};
use crate::error::NilmError;
use crate::utils::{round_to, truncate_to_second};

use active::Release;
use edge::{Edge, EdgeDecision};
use smoothing::DetectorState;

pub use active::ActiveAppliance;
pub use replay::{HistoryPoint, HistorySource, ReanalysisAbort, ReanalysisSummary};

/// Most rows returned by [`NilmEngine::recent_events`].
pub const RECENT_EVENTS_LIMIT: usize = 100;

/// Id carried by a signature that has not been written yet.
const UNSAVED_ID: i64 = 0;

const UNKNOWN_LABEL: &str = "Unknown";
const UNKNOWN_ICON: &str = "\u{1F50C}";
const UNKNOWN_COLOR: &str = "#6b7280";

/// A freshly recorded event plus the label to announce it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEvent {
    #[serde(flatten)]
    pub event: LoadEvent,
    pub label: String,
}

/// An event joined with its signature's presentation for the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: LoadEvent,
    pub label: String,
    pub icon: String,
    pub color: String,
}

pub struct NilmEngine<S: Store> {
    store: S,
    config: RwLock<NilmConfig>,
    detector: Mutex<DetectorState>,
    abort_replay: Arc<AtomicBool>,
}

impl<S: Store> NilmEngine<S> {
    pub fn new(store: S, config: NilmConfig) -> Result<Self, NilmError> {
        config.validate().map_err(NilmError::Config)?;
        Ok(NilmEngine {
            store,
            detector: Mutex::new(DetectorState::new(config.smoothing_window)),
            config: RwLock::new(config),
            abort_replay: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> NilmConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swap thresholds at runtime. Stored rows are left as they are; a new smoothing
    /// window keeps the newest readings that still fit.
    pub fn set_config(&self, config: NilmConfig) -> Result<(), NilmError> {
        config.validate().map_err(NilmError::Config)?;
        let mut detector = self.lock_detector();
        detector.resize(config.smoothing_window);
        info!(
            "Detection config updated: threshold {}W, debounce {}s, tolerance {}, window {}, idle {}W",
            config.edge_threshold_w,
            config.debounce_secs,
            config.signature_tolerance,
            config.smoothing_window,
            config.idle_load_w
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    pub(crate) fn lock_detector(&self) -> MutexGuard<'_, DetectorState> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reading taken now and return the smoothed total.
    pub fn ingest(&self, total: f64, leg1: Option<f64>, leg2: Option<f64>) -> Result<f64, NilmError> {
        self.ingest_at(Utc::now(), total, leg1, leg2)
    }

    pub fn ingest_at(
        &self,
        at: DateTime<Utc>,
        total: f64,
        leg1: Option<f64>,
        leg2: Option<f64>,
    ) -> Result<f64, NilmError> {
        let mut detector = self.lock_detector();
        let mut next = detector.clone();
        let smoothed = next.push_reading(total, leg1, leg2);

        self.store.put_sample(&LoadSample {
            time: truncate_to_second(at),
            load_total: total,
            load_l1: leg1.unwrap_or(0.0),
            load_l2: leg2.unwrap_or(0.0),
            smoothed_total: round_to(smoothed, 1),
        })?;

        *detector = next;
        Ok(smoothed)
    }

    /// Look for a step in the newest reading. `timestamp` defaults to now; replays
    /// pass the sample's own time so debounce and pairing follow historical time.
    pub fn detect(
        &self,
        smoothed: f64,
        leg1: Option<f64>,
        leg2: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Option<DetectedEvent>, NilmError> {
        let cfg = self.config();
        let mut detector = self.lock_detector();
        let at = truncate_to_second(timestamp.unwrap_or_else(Utc::now));
        Ok(self.detect_locked(&mut detector, &cfg, smoothed, leg1, leg2, at, false)?)
    }

    /// Detection with the writer lock already held. On a store failure the baseline
    /// and debounce clock are left untouched so the next sample can retry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn detect_locked(
        &self,
        state: &mut DetectorState,
        cfg: &NilmConfig,
        smoothed: f64,
        leg1: Option<f64>,
        leg2: Option<f64>,
        at: DateTime<Utc>,
        replay: bool,
    ) -> Result<Option<DetectedEvent>, StoreError> {
        match edge::evaluate(state, smoothed, leg1, leg2, at, cfg) {
            EdgeDecision::Seed(level) | EdgeDecision::Stable(level) => {
                state.baseline = Some(level);
                Ok(None)
            }
            EdgeDecision::Debounced => Ok(None),
            EdgeDecision::Accepted(edge) => {
                let detected = self.record_edge(cfg, &edge, at, replay)?;
                state.baseline = Some(edge.level);
                state.last_event_at = Some(at);
                Ok(Some(detected))
            }
        }
    }

    /// Decide everything an edge changes from a consistent read, then hand the
    /// store one batch to apply.
    fn record_edge(
        &self,
        cfg: &NilmConfig,
        edge: &Edge,
        at: DateTime<Utc>,
        replay: bool,
    ) -> Result<DetectedEvent, StoreError> {
        let known = self.store.list_signatures()?;
        let matched = signatures::find_matching_signature(&known, edge.power_delta, edge.leg, cfg.signature_tolerance);
        let is_new = matched.is_none();
        let mut sig = match matched {
            Some(existing) => {
                let mut sig = existing.clone();
                signatures::absorb(&mut sig, edge.power_delta);
                sig
            }
            None => signatures::new_signature(edge.power_delta, edge.leg).into_signature(UNSAVED_ID),
        };

        let mut released = None;
        let mut closes = None;
        let mut cycle = None;
        match edge.kind {
            EventKind::On => active::mark_on(&mut sig, at),
            EventKind::Off => {
                let paired = pairing::pair_off_event(&self.store, cfg, &mut sig, &known, at, edge.power_delta)?;
                closes = paired.map(|p| (p.on_event_id, p.duration));
                if let Release::Other(other) = active::release_off(cfg, &mut sig, &known, edge.power_delta) {
                    released = Some(other);
                }
                if let Some(p) = paired.filter(|p| p.duration > 0) {
                    let days = if is_new {
                        Vec::new()
                    } else {
                        self.store.list_daily_stats(sig.id, None)?
                    };
                    cycle = Some(stats::plan_cycle(&mut sig, days, at, edge.power_delta, p.duration));
                }
            }
        }
        let duration = closes.map(|(_, secs)| secs);

        let event = NewLoadEvent {
            time: at,
            event_type: edge.kind,
            power_delta: edge.power_delta,
            leg: edge.leg,
            duration,
            signature_id: sig.id,
            confidence: edge.confidence,
        };
        let signature = if is_new {
            SignatureWrite::Create(NewSignature::from(&sig))
        } else {
            SignatureWrite::Update(sig)
        };
        let (sig, event) = self.store.record_edge(&EdgeWrite {
            signature,
            released,
            closes,
            cycle,
            event,
        })?;
        if is_new {
            debug!("New signature {} at {}W ({})", sig.id, sig.power_avg, sig.user_label);
        }

        let ran_for = duration.map(|d| format!(", ran for {}s", d)).unwrap_or_default();
        if replay {
            debug!(
                "{} turned {} ({}W{}) [confidence: {}]",
                sig.user_label, edge.kind, edge.power_delta, ran_for, edge.confidence
            );
        } else {
            info!(
                "{} turned {} ({}W{}) [confidence: {}]",
                sig.user_label, edge.kind, edge.power_delta, ran_for, edge.confidence
            );
        }

        Ok(DetectedEvent {
            event,
            label: sig.user_label,
        })
    }

    /// Clear "running" state left behind by a previous process and give up on every
    /// "on" event still waiting for its "off". Returns the number of signatures.
    pub fn startup(&self) -> Result<usize, NilmError> {
        let _writer = self.lock_detector();
        let signatures = self.store.deactivate_all_signatures()?;
        let expired = self.store.expire_unresolved_on_events(Utc::now())?;
        info!("Loaded {} appliance signature(s), expired {} orphaned on-event(s)", signatures, expired);
        Ok(signatures)
    }

    pub fn recent_events(&self, hours: i64) -> Result<Vec<EventView>, NilmError> {
        self.recent_events_at(hours, Utc::now())
    }

    /// Events of the last `hours` before `now`, newest first.
    pub fn recent_events_at(&self, hours: i64, now: DateTime<Utc>) -> Result<Vec<EventView>, NilmError> {
        let signatures = self.store.list_signatures()?;
        let events = self
            .store
            .list_events_since(now - Duration::hours(hours), RECENT_EVENTS_LIMIT)?;
        Ok(events
            .into_iter()
            .map(|event| {
                let sig = signatures.iter().find(|s| s.id == event.signature_id);
                EventView {
                    label: sig.map_or(UNKNOWN_LABEL, |s| s.user_label.as_str()).to_string(),
                    icon: sig.map_or(UNKNOWN_ICON, |s| s.icon.as_str()).to_string(),
                    color: sig.map_or(UNKNOWN_COLOR, |s| s.color.as_str()).to_string(),
                    event,
                }
            })
            .collect())
    }

    /// Every signature, most frequently seen first.
    pub fn signatures(&self) -> Result<Vec<Signature>, NilmError> {
        let mut all = self.store.list_signatures()?;
        all.sort_by(|a, b| b.event_count.cmp(&a.event_count));
        Ok(all)
    }

    /// Set any of label, icon and color. Returns false for an unknown id.
    pub fn update_label(
        &self,
        id: i64,
        label: Option<String>,
        icon: Option<String>,
        color: Option<String>,
    ) -> Result<bool, NilmError> {
        let _writer = self.lock_detector();
        let Some(mut sig) = self.store.get_signature(id)? else {
            return Ok(false);
        };
        if let Some(label) = label {
            sig.user_label = label;
        }
        if let Some(icon) = icon {
            sig.icon = icon;
        }
        if let Some(color) = color {
            sig.color = color;
        }
        self.store.update_signature(&sig)?;
        Ok(true)
    }

    /// Fold `merge_id` into `keep_id`: events and daily stats move over, statistics
    /// combine count-weighted and `merge_id` is deleted. False if either id is
    /// unknown or both are the same.
    pub fn merge(&self, keep_id: i64, merge_id: i64) -> Result<bool, NilmError> {
        if keep_id == merge_id {
            return Ok(false);
        }
        let _writer = self.lock_detector();
        let (Some(mut keep), Some(gone)) = (self.store.get_signature(keep_id)?, self.store.get_signature(merge_id)?)
        else {
            return Ok(false);
        };

        let total = keep.event_count + gone.event_count;
        if total > 0 {
            keep.power_avg = round_to(
                (keep.power_avg * keep.event_count as f64 + gone.power_avg * gone.event_count as f64) / total as f64,
                1,
            );
        }
        keep.power_min = keep.power_min.min(gone.power_min);
        keep.power_max = keep.power_max.max(gone.power_max);
        keep.event_count = total;
        keep.active_count += gone.active_count;
        keep.is_active = keep.active_count > 0;
        keep.last_on_time = keep.last_on_time.max(gone.last_on_time);

        let moved = self.store.reassign_events(merge_id, keep_id)?;
        for day in self.store.list_daily_stats(merge_id, None)? {
            self.store
                .upsert_daily_stats(day.date, keep_id, day.cycles, day.total_duration, day.energy_kwh)?;
        }
        self.store.delete_daily_stats(merge_id)?;

        if let Some(mean) = stats::mean_daily_cycles(&self.store.list_daily_stats(keep_id, None)?) {
            keep.daily_cycles = mean;
        }

        self.store.update_signature(&keep)?;
        self.store.delete_signature(merge_id)?;
        info!(
            "Merged signature {} into {} ({} event(s) moved, now {}W)",
            merge_id, keep_id, moved, keep.power_avg
        );
        Ok(true)
    }

    pub fn daily_stats(&self, signature_id: i64, days: i64) -> Result<Vec<DailyStat>, NilmError> {
        self.daily_stats_at(signature_id, days, Utc::now())
    }

    /// Per-day rows for the last `days` days, newest first.
    pub fn daily_stats_at(&self, signature_id: i64, days: i64, now: DateTime<Utc>) -> Result<Vec<DailyStat>, NilmError> {
        let since = (now - Duration::days(days)).date_naive();
        Ok(self.store.list_daily_stats(signature_id, Some(since))?)
    }

    pub fn cleanup(&self) -> Result<(usize, usize), NilmError> {
        self.cleanup_at(Utc::now())
    }

    /// Apply the sample and event retention periods. Returns `(samples, events)` removed.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<(usize, usize), NilmError> {
        let cfg = self.config();
        let samples = self
            .store
            .delete_samples_before(now - Duration::days(cfg.sample_retention_days))?;
        let events = self
            .store
            .delete_events_before(now - Duration::days(cfg.event_retention_days))?;
        if samples > 0 || events > 0 {
            info!("Retention cleanup removed {} sample(s) and {} event(s)", samples, events);
        }
        Ok((samples, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::STALE_DURATION;
    use crate::db::memory::MemoryStore;
    use crate::db::models::Leg;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn is_stale(event: &LoadEvent) -> bool {
        event.duration == Some(STALE_DURATION)
    }

    fn engine() -> NilmEngine<MemoryStore> {
        NilmEngine::new(MemoryStore::new(), NilmConfig::default()).unwrap()
    }

    /// Each level held long enough for the baseline to settle on it.
    fn profile(levels: &[f64]) -> Vec<f64> {
        levels.iter().flat_map(|level| std::iter::repeat_n(*level, 150)).collect()
    }

    /// Feed a reading every 5 s starting at `start`, returning detected events.
    fn feed(engine: &NilmEngine<MemoryStore>, start: DateTime<Utc>, readings: &[f64]) -> Vec<DetectedEvent> {
        let mut found = Vec::new();
        for (i, watts) in readings.iter().enumerate() {
            let at = start + Duration::seconds(5 * i as i64);
            let smoothed = engine.ingest_at(at, *watts, None, None).unwrap();
            if let Some(event) = engine.detect(smoothed, None, None, Some(at)).unwrap() {
                found.push(event);
            }
        }
        found
    }

    #[test]
    fn sub_threshold_noise_never_fires() {
        let e = engine();
        let readings: Vec<f64> = (0..200).map(|i| 300.0 + if i % 2 == 0 { 9.0 } else { -9.0 }).collect();
        assert!(feed(&e, t0(), &readings).is_empty());

        // a slow creep to 315 W is absorbed by the baseline
        let creep: Vec<f64> = (0..400).map(|i| 300.0 + (i as f64 * 0.05).min(15.0)).collect();
        assert!(feed(&e, t0() + Duration::hours(1), &creep).is_empty());
        let baseline = e.lock_detector().baseline.unwrap();
        assert!((baseline - 315.0).abs() < 1.0, "baseline {}", baseline);
        assert!(e.store().all_events().is_empty());
    }

    #[test]
    fn debounce_keeps_only_first_edge() {
        let e = engine();
        feed(&e, t0(), &[100.0, 100.0, 100.0]);
        let at = t0() + Duration::seconds(60);
        e.ingest_at(at, 300.0, None, None).unwrap();
        assert!(e.detect(200.0, None, None, Some(at)).unwrap().is_some());
        // 4 s later another step; suppressed
        let at = at + Duration::seconds(4);
        e.ingest_at(at, 600.0, None, None).unwrap();
        assert!(e.detect(400.0, None, None, Some(at)).unwrap().is_none());
        assert_eq!(e.store().all_events().len(), 1);
    }

    #[test]
    fn on_off_pair_yields_duration_and_stats() {
        let e = engine();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 120]);
        readings.extend(vec![100.0; 4]);
        let events = feed(&e, t0(), &readings);

        assert_eq!(events.len(), 2);
        let (on, off) = (&events[0].event, &events[1].event);
        assert_eq!(on.event_type, EventKind::On);
        assert_eq!(off.event_type, EventKind::Off);
        assert_eq!(on.power_delta, 150.0);
        assert_eq!(off.signature_id, on.signature_id);
        assert_eq!(off.duration, Some(600));

        let stored_on = e.store().all_events().into_iter().find(|ev| ev.id == on.id).unwrap();
        assert_eq!(stored_on.duration, Some(600));

        let sigs = e.signatures().unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].event_count, 2);
        assert_eq!(sigs[0].power_avg, 150.0);
        assert_eq!(sigs[0].active_count, 0);
        assert!(!sigs[0].is_active);
        assert_eq!(sigs[0].avg_duration, 600.0);
        assert_eq!(sigs[0].daily_cycles, 1.0);

        let days = e.daily_stats_at(sigs[0].id, 7, t0()).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].cycles, 1);
        assert_eq!(days[0].total_duration, 600);
        assert!((days[0].energy_kwh - 0.025).abs() < 1e-9);
    }

    #[test]
    fn similar_steps_share_a_signature() {
        let e = engine();
        let events = feed(&e, t0(), &profile(&[100.0, 248.0, 100.0, 252.0, 100.0, 251.0, 100.0]));
        assert_eq!(events.len(), 6);

        let sigs = e.signatures().unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].event_count, 6);
        // running mean of 148, 148, 152, 152, 151, 151 at one decimal
        assert!((sigs[0].power_avg - 150.3).abs() < 1e-9);
        assert!(sigs[0].power_min <= sigs[0].power_avg && sigs[0].power_avg <= sigs[0].power_max);
        assert!(events.iter().all(|d| d.event.signature_id == sigs[0].id));
    }

    #[test]
    fn far_step_creates_new_signature() {
        let e = engine();
        feed(&e, t0(), &profile(&[100.0, 250.0, 100.0, 2100.0]));

        let sigs = e.store().list_signatures().unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].power_avg, 150.0);
        assert_eq!(sigs[0].event_count, 2);
        assert_eq!(sigs[1].power_avg, 2000.0);
        assert_eq!(sigs[1].event_count, 1);
        assert_eq!(sigs[1].user_label, "Major Appliance");
        assert_eq!(sigs[1].active_count, 1);
    }

    #[test]
    fn store_failure_leaves_detector_untouched() {
        let e = engine();
        feed(&e, t0(), &[100.0, 100.0, 100.0]);
        let before = e.lock_detector().clone();

        e.store().set_fail_writes(true);
        let at = t0() + Duration::seconds(60);
        assert!(e.ingest_at(at, 400.0, None, None).is_err());
        assert_eq!(*e.lock_detector(), before);

        // the edge itself fails to persist: no baseline move, no debounce stamp
        {
            let mut state = e.lock_detector();
            state.push_reading(400.0, None, None);
        }
        let before = e.lock_detector().clone();
        assert!(e.detect(200.0, None, None, Some(at)).is_err());
        assert_eq!(*e.lock_detector(), before);

        e.store().set_fail_writes(false);
        let retried = e.detect(200.0, None, None, Some(at + Duration::seconds(1))).unwrap();
        assert_eq!(retried.map(|d| d.event.power_delta), Some(300.0));
    }

    #[test]
    fn failed_off_is_retried_with_its_pairing() {
        let e = engine();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 120]);
        feed(&e, t0(), &readings);
        let on_id = e.store().all_events()[0].id;
        let sig_id = e.signatures().unwrap()[0].id;

        let at = t0() + Duration::seconds(5 * 124);
        let smoothed = e.ingest_at(at, 100.0, None, None).unwrap();
        e.store().set_fail_writes(true);
        assert!(e.detect(smoothed, None, None, Some(at)).is_err());

        // the "on" is still open and nothing was booked
        let events = e.store().all_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration, None);
        assert!(e.daily_stats_at(sig_id, 7, t0()).unwrap().is_empty());
        assert_eq!(e.signatures().unwrap()[0].active_count, 1);

        e.store().set_fail_writes(false);
        let off = e.detect(smoothed, None, None, Some(at)).unwrap().unwrap();
        assert_eq!(off.event.event_type, EventKind::Off);
        assert_eq!(off.event.duration, Some(600));

        let on = e.store().all_events().into_iter().find(|ev| ev.id == on_id).unwrap();
        assert_eq!(on.duration, Some(600));
        let days = e.daily_stats_at(sig_id, 7, t0()).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].cycles, 1);
        let sig = &e.signatures().unwrap()[0];
        assert_eq!(sig.active_count, 0);
        assert_eq!(sig.avg_duration, 600.0);
    }

    #[test]
    fn label_update_and_unknown_ids() {
        let e = engine();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 4]);
        feed(&e, t0(), &readings);
        let id = e.signatures().unwrap()[0].id;

        assert!(e.update_label(id, Some("Fridge".to_string()), None, Some("#123456".to_string())).unwrap());
        let sig = e.store().get_signature(id).unwrap().unwrap();
        assert_eq!(sig.user_label, "Fridge");
        assert_eq!(sig.color, "#123456");
        assert_eq!(sig.icon, "\u{2744}\u{FE0F}");

        assert!(!e.update_label(9999, Some("x".to_string()), None, None).unwrap());
        assert!(!e.merge(id, 9999).unwrap());
        assert!(!e.merge(id, id).unwrap());
    }

    #[test]
    fn merge_moves_events_and_stats() {
        let e = engine();
        feed(&e, t0(), &profile(&[100.0, 250.0, 100.0, 500.0, 100.0]));

        let sigs = e.store().list_signatures().unwrap();
        assert_eq!(sigs.len(), 2);
        let (a, b) = (sigs[0].clone(), sigs[1].clone());
        assert!(e.merge(a.id, b.id).unwrap());

        let remaining = e.signatures().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|s| s.id != b.id));
        let merged = &remaining[0];
        assert_eq!(merged.event_count, 4);
        assert_eq!(merged.power_avg, 275.0);
        assert_eq!(merged.power_min, 150.0);
        assert_eq!(merged.power_max, 400.0);
        assert!(e.store().all_events().iter().all(|ev| ev.signature_id == a.id));

        let days = e.daily_stats_at(a.id, 7, t0()).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].cycles, 2);
        assert!(e.daily_stats_at(b.id, 7, t0()).unwrap().is_empty());
        assert_eq!(merged.daily_cycles, 2.0);
    }

    #[test]
    fn recent_events_newest_first_with_fallback_presentation() {
        let e = engine();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 10]);
        readings.extend(vec![100.0; 10]);
        feed(&e, t0(), &readings);

        let now = t0() + Duration::hours(1);
        let views = e.recent_events_at(24, now).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].event.event_type, EventKind::Off);
        assert_eq!(views[0].label, "Medium Device");

        let sig_id = views[0].event.signature_id;
        e.store().delete_signature(sig_id).unwrap();
        let views = e.recent_events_at(24, now).unwrap();
        assert_eq!(views[0].label, UNKNOWN_LABEL);
        assert_eq!(views[0].color, UNKNOWN_COLOR);

        assert!(e.recent_events_at(1, now + Duration::hours(2)).unwrap().is_empty());
    }

    #[test]
    fn startup_clears_leftover_running_state() {
        let e = engine();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 4]);
        feed(&e, t0(), &readings);
        assert_eq!(e.signatures().unwrap()[0].active_count, 1);

        assert_eq!(e.startup().unwrap(), 1);
        let sig = &e.signatures().unwrap()[0];
        assert_eq!(sig.active_count, 0);
        assert!(!sig.is_active);
        assert!(e.store().all_events().iter().all(is_stale));
    }

    #[test]
    fn idle_load_prunes_everything() {
        let e = engine();
        let mut readings = vec![70.0; 4];
        readings.extend(vec![220.0; 10]);
        readings.extend(vec![520.0; 10]);
        feed(&e, t0(), &readings);
        assert_eq!(e.store().list_unresolved_on_events(Some(t0())).unwrap().len(), 2);

        let active = e.active_appliances_at(Some(70.0), t0() + Duration::minutes(5)).unwrap();
        assert!(active.is_empty());
        let events = e.store().all_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(is_stale));
        assert!(e.signatures().unwrap().iter().all(|s| s.active_count == 0 && !s.is_active));
    }

    #[test]
    fn cleanup_applies_retention() {
        let e = engine();
        feed(&e, t0(), &[100.0, 100.0, 250.0, 250.0]);
        let later = t0() + Duration::days(8);
        feed(&e, later, &[100.0]);

        let (samples, events) = e.cleanup_at(later).unwrap();
        assert_eq!(samples, 4);
        assert_eq!(events, 0);
        assert_eq!(e.store().list_samples().unwrap().len(), 1);

        let (_, events) = e.cleanup_at(t0() + Duration::days(31)).unwrap();
        assert_eq!(events, 1);
    }

    #[test]
    fn config_changes_apply_forward() {
        let e = engine();
        let bad = NilmConfig {
            smoothing_window: 0,
            ..NilmConfig::default()
        };
        assert!(matches!(e.set_config(bad), Err(NilmError::Config(_))));

        let wider = NilmConfig {
            edge_threshold_w: 500.0,
            ..NilmConfig::default()
        };
        e.set_config(wider).unwrap();
        let mut readings = vec![100.0; 4];
        readings.extend(vec![250.0; 4]);
        assert!(feed(&e, t0(), &readings).is_empty());
        assert_eq!(e.config().edge_threshold_w, 500.0);
    }

    #[test]
    fn legs_are_recorded() {
        let e = engine();
        for i in 0..3 {
            let at = t0() + Duration::seconds(5 * i);
            let s = e.ingest_at(at, 100.0, Some(50.0), Some(50.0)).unwrap();
            e.detect(s, Some(50.0), Some(50.0), Some(at)).unwrap();
        }
        let at = t0() + Duration::seconds(60);
        let s = e.ingest_at(at, 1100.0, Some(1050.0), Some(50.0)).unwrap();
        let event = e.detect(s, Some(1050.0), Some(50.0), Some(at)).unwrap().unwrap();
        assert_eq!(event.event.leg, Leg::L1);
        assert_eq!(event.event.confidence, 1.0);
    }
}
