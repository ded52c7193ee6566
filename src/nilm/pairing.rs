//! Pairs an "off" step with the "on" step it ends.
//!
//! Matching is by power similarity rather than by signature identity, so a motor
//! whose start and stop steps differ a little still closes its cycle.

use chrono::{DateTime, Duration, Utc};

use crate::config::NilmConfig;
use crate::db::models::{LoadEvent, Signature};
use crate::db::store::{Store, StoreError};
use crate::utils::round_to;

/// Accept a pair when the power gap is within this share of the off step...
const PAIR_RELATIVE_BAND: f64 = 0.4;
/// ...or within this many watts, whichever is larger.
const PAIR_ABSOLUTE_BAND_W: f64 = 40.0;

/// An unresolved "on" event together with its signature's current average.
#[derive(Debug, Clone)]
pub struct PairCandidate {
    pub event: LoadEvent,
    pub signature_avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pairing {
    pub on_event_id: i64,
    /// Whole seconds from the "on" to the "off".
    pub duration: i64,
}

/// Pick the candidate closest in power; candidates must be sorted oldest first so
/// that ties resolve FIFO.
pub fn choose_pair(candidates: &[PairCandidate], off_time: DateTime<Utc>, off_power: f64) -> Option<Pairing> {
    let mut best: Option<(&PairCandidate, f64)> = None;
    for candidate in candidates.iter().filter(|c| c.event.time <= off_time) {
        let diff = (off_power - candidate.event.power_delta)
            .abs()
            .min((off_power - candidate.signature_avg).abs());
        if best.is_none_or(|(_, best_diff)| diff < best_diff) {
            best = Some((candidate, diff));
        }
    }

    let (candidate, diff) = best?;
    if diff > (off_power * PAIR_RELATIVE_BAND).max(PAIR_ABSOLUTE_BAND_W) {
        return None;
    }
    Some(Pairing {
        on_event_id: candidate.event.id,
        duration: (off_time - candidate.event.time).num_seconds(),
    })
}

/// Running mean of cycle length, counting one cycle per on/off pair of events.
pub fn fold_duration(sig: &mut Signature, duration: i64) {
    let cycles = (sig.event_count / 2).max(1) as f64;
    sig.avg_duration = round_to((sig.avg_duration * (cycles - 1.0) + duration as f64) / cycles, 1);
}

/// Find the "on" event that `off_power` at `off_time` terminates and fold its
/// duration into `off_signature`. Nothing is written; the caller closes the "on"
/// event together with the rest of the edge.
pub fn pair_off_event<S: Store>(
    store: &S,
    cfg: &NilmConfig,
    off_signature: &mut Signature,
    signatures: &[Signature],
    off_time: DateTime<Utc>,
    off_power: f64,
) -> Result<Option<Pairing>, StoreError> {
    let cutoff = off_time - Duration::hours(cfg.pairing_window_hours);
    let candidates: Vec<PairCandidate> = store
        .list_unresolved_on_events(Some(cutoff))?
        .into_iter()
        .filter_map(|event| {
            let avg = if event.signature_id == off_signature.id {
                off_signature.power_avg
            } else {
                signatures.iter().find(|s| s.id == event.signature_id)?.power_avg
            };
            Some(PairCandidate {
                event,
                signature_avg: avg,
            })
        })
        .collect();

    let pairing = choose_pair(&candidates, off_time, off_power);
    if let Some(pairing) = pairing {
        fold_duration(off_signature, pairing.duration);
    }
    Ok(pairing)
}
