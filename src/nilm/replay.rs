//! Rebuild every derived table by replaying raw load history.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::SourceError;
use crate::config::NilmConfig;
use crate::db::store::{Store, StoreError};
use crate::error::NilmError;
use crate::nilm::NilmEngine;
use crate::nilm::signatures::LabelRestoreTable;
use crate::nilm::smoothing::DetectorState;
use crate::utils::truncate_to_second;

/// One total-load reading from a bulk history pull.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub time: DateTime<Utc>,
    pub watts: f64,
}

/// Somewhere to pull a longer load history from than the local sample table keeps.
pub trait HistorySource {
    /// Human readable origin, reported back in the summary.
    fn describe(&self) -> String;
    fn fetch_load_history(&self) -> Result<Vec<HistoryPoint>, SourceError>;
}

impl<F> HistorySource for F
where
    F: Fn() -> Result<Vec<HistoryPoint>, SourceError>,
{
    fn describe(&self) -> String {
        "external history".to_string()
    }

    fn fetch_load_history(&self) -> Result<Vec<HistoryPoint>, SourceError> {
        self()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReanalysisSummary {
    pub samples: usize,
    pub events: usize,
    pub signatures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// First and last replayed timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub restored_labels: usize,
    /// Stopped early by [`NilmEngine::abort_reanalysis`].
    pub aborted: bool,
}

/// Stops a running reanalysis from anywhere the engine itself is not reachable.
#[derive(Debug, Clone)]
pub struct ReanalysisAbort(Arc<AtomicBool>);

impl ReanalysisAbort {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A reading to replay, with legs when the source recorded them.
struct ReplaySample {
    time: DateTime<Utc>,
    total: f64,
    leg1: Option<f64>,
    leg2: Option<f64>,
}

impl<S: Store> NilmEngine<S> {
    /// Ask a running reanalysis to stop before its next sample. Whatever was rebuilt
    /// so far is kept.
    pub fn abort_reanalysis(&self) {
        self.abort_replay.store(true, Ordering::SeqCst);
    }

    pub fn abort_handle(&self) -> ReanalysisAbort {
        ReanalysisAbort(Arc::clone(&self.abort_replay))
    }

    /// Replay the locally retained samples.
    pub fn reanalyze_local(&self) -> Result<ReanalysisSummary, NilmError> {
        let samples: Vec<ReplaySample> = self
            .store
            .list_samples()?
            .into_iter()
            .map(|s| ReplaySample {
                time: s.time,
                total: s.load_total,
                leg1: Some(s.load_l1),
                leg2: Some(s.load_l2),
            })
            .collect();
        if samples.is_empty() {
            warn!("Reanalysis skipped: no stored samples");
            return Ok(ReanalysisSummary::default());
        }

        let summary = self.replay(&samples)?;
        info!(
            "Reanalysis: {} samples -> {} events, {} signatures",
            summary.samples, summary.events, summary.signatures
        );
        Ok(summary)
    }

    /// Replay a bulk pull (total load only). The pull happens before live ingestion
    /// is paused.
    pub fn reanalyze_from_source<H: HistorySource + ?Sized>(&self, source: &H) -> Result<ReanalysisSummary, NilmError> {
        let description = source.describe();
        info!("Pulling load history from {}", description);
        let mut points = source.fetch_load_history()?;
        if points.is_empty() {
            warn!("Reanalysis skipped: {} returned no data", description);
            return Ok(ReanalysisSummary {
                source: Some(description),
                ..ReanalysisSummary::default()
            });
        }
        points.sort_by_key(|p| p.time);

        let samples: Vec<ReplaySample> = points
            .iter()
            .map(|p| ReplaySample {
                time: truncate_to_second(p.time),
                total: p.watts,
                leg1: None,
                leg2: None,
            })
            .collect();
        let first = samples[0].time;
        let last = samples[samples.len() - 1].time;
        info!("Got {} samples from {} to {}", samples.len(), first, last);

        let mut summary = self.replay(&samples)?;
        summary.source = Some(description);
        summary.date_range = Some((first, last));
        info!(
            "Reanalysis from {}: {} samples -> {} events, {} signatures",
            summary.source.as_deref().unwrap_or_default(),
            summary.samples,
            summary.events,
            summary.signatures
        );
        Ok(summary)
    }

    fn replay(&self, samples: &[ReplaySample]) -> Result<ReanalysisSummary, NilmError> {
        let cfg = self.config();
        let mut detector = self.lock_detector();

        let saved = LabelRestoreTable::capture(&self.store.list_signatures()?);
        self.store.clear_derived()?;
        *detector = DetectorState::new(cfg.smoothing_window);
        self.abort_replay.store(false, Ordering::SeqCst);

        let mut summary = ReanalysisSummary::default();
        let outcome = self.replay_samples(&mut detector, &cfg, samples, &mut summary);

        // whatever happened, nothing replayed is "running now"
        self.store.deactivate_all_signatures()?;
        outcome?;

        summary.signatures = self.store.list_signatures()?.len();
        summary.restored_labels = saved.apply(&self.store, &cfg)?;
        if summary.aborted {
            warn!("Reanalysis aborted after {} of {} samples", summary.samples, samples.len());
        }
        Ok(summary)
    }

    fn replay_samples(
        &self,
        detector: &mut DetectorState,
        cfg: &NilmConfig,
        samples: &[ReplaySample],
        summary: &mut ReanalysisSummary,
    ) -> Result<(), StoreError> {
        for sample in samples {
            if self.abort_replay.swap(false, Ordering::SeqCst) {
                summary.aborted = true;
                break;
            }
            let smoothed = detector.push_reading(sample.total, sample.leg1, sample.leg2);
            if self
                .detect_locked(detector, cfg, smoothed, sample.leg1, sample.leg2, sample.time, true)?
                .is_some()
            {
                summary.events += 1;
            }
            summary.samples += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::services::fake_data::{HouseholdProfile, generate_household};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn source<F: Fn() -> Result<Vec<HistoryPoint>, SourceError>>(f: F) -> F {
        f
    }

    fn seeded_engine() -> NilmEngine<MemoryStore> {
        let store = MemoryStore::new();
        let profile = HouseholdProfile {
            start: t0(),
            hours: 6,
            ..HouseholdProfile::default()
        };
        generate_household(&store, &profile, 7).unwrap();
        NilmEngine::new(store, NilmConfig::default()).unwrap()
    }

    #[test]
    fn empty_history_is_a_zero_summary() {
        let engine = NilmEngine::new(MemoryStore::new(), NilmConfig::default()).unwrap();
        assert_eq!(engine.reanalyze_local().unwrap(), ReanalysisSummary::default());

        let summary = engine.reanalyze_from_source(&source(|| Ok(Vec::new()))).unwrap();
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.source.as_deref(), Some("external history"));
    }

    #[test]
    fn replay_is_deterministic() {
        let engine = seeded_engine();
        let first = engine.reanalyze_local().unwrap();
        assert!(first.events > 0);
        assert!(first.signatures > 0);
        let events_after_first = engine.store().all_events();

        let second = engine.reanalyze_local().unwrap();
        assert_eq!(first.samples, second.samples);
        assert_eq!(first.events, second.events);
        assert_eq!(first.signatures, second.signatures);
        assert_eq!(engine.store().all_events().len(), events_after_first.len());

        // raw samples are never touched
        assert_eq!(engine.store().list_samples().unwrap().len(), 6 * 3600 / 10);
        assert!(engine.signatures().unwrap().iter().all(|s| !s.is_active && s.active_count == 0));
    }

    #[test]
    fn user_labels_survive_and_placeholders_do_not_stick() {
        let engine = seeded_engine();
        engine.reanalyze_local().unwrap();
        let sigs = engine.signatures().unwrap();
        let target = sigs[0].clone();
        engine
            .update_label(target.id, Some("Fridge".to_string()), Some("F".to_string()), None)
            .unwrap();

        let summary = engine.reanalyze_local().unwrap();
        assert_eq!(summary.restored_labels, 1);
        let rebuilt = engine.signatures().unwrap();
        let fridge: Vec<_> = rebuilt.iter().filter(|s| s.user_label == "Fridge").collect();
        assert_eq!(fridge.len(), 1);
        assert!((fridge[0].power_avg - target.power_avg).abs() <= target.power_avg * 0.3);
        assert_eq!(fridge[0].icon, "F");
        // the rest went back to suggestions
        assert!(
            rebuilt
                .iter()
                .filter(|s| s.id != fridge[0].id)
                .all(|s| crate::nilm::signatures::is_auto_label(&s.user_label))
        );
    }

    #[test]
    fn source_replay_reports_origin_and_range() {
        let engine = NilmEngine::new(MemoryStore::new(), NilmConfig::default()).unwrap();
        let mut points: Vec<HistoryPoint> = (0..240)
            .map(|i| HistoryPoint {
                time: t0() + Duration::seconds(10 * i),
                watts: if (60..180).contains(&i) { 1300.0 } else { 100.0 },
            })
            .collect();
        points.reverse();

        let summary = engine.reanalyze_from_source(&source(move || Ok(points.clone()))).unwrap();
        assert_eq!(summary.samples, 240);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.signatures, 1);
        assert_eq!(summary.date_range, Some((t0(), t0() + Duration::seconds(2390))));

        let events = engine.store().all_events();
        assert_eq!(events[1].duration, Some(1200));
        assert!(engine.store().list_samples().unwrap().is_empty());
    }

    #[test]
    fn source_failure_keeps_existing_state() {
        let engine = seeded_engine();
        engine.reanalyze_local().unwrap();
        let before = engine.signatures().unwrap();

        let err = engine
            .reanalyze_from_source(&source(|| Err(SourceError::Transport("connection refused".to_string()))))
            .unwrap_err();
        assert!(matches!(err, NilmError::Source(_)));
        assert_eq!(engine.signatures().unwrap(), before);
    }

    #[test]
    fn abort_flag_is_cleared_by_a_new_run() {
        let engine = seeded_engine();
        // a stale request from before the run starts does not cancel it
        engine.abort_reanalysis();
        let summary = engine.reanalyze_local().unwrap();
        assert!(!summary.aborted);
        assert_eq!(summary.samples, 6 * 3600 / 10);
    }

    #[test]
    fn abort_stops_a_running_replay() {
        let engine = seeded_engine();
        let full = engine.reanalyze_local().unwrap();
        assert!(full.events > 3);

        // the counter keeps running across replays
        let trigger = full.events + 3;
        let handle = engine.abort_handle();
        engine.store().set_edge_hook(move |edges| {
            if edges == trigger {
                handle.abort();
            }
        });
        let cut = engine.reanalyze_local().unwrap();
        assert!(cut.aborted);
        assert_eq!(cut.events, 3);
        assert!(cut.samples < full.samples);
        assert_eq!(engine.store().all_events().len(), 3);
        assert!(engine.signatures().unwrap().iter().all(|s| !s.is_active && s.active_count == 0));
    }
}
