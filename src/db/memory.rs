//! In-process [`Store`] for tests and dry runs. Nothing survives the process.
//!
//! Times and dates outside what a PostgreSQL `timestamptz`/`date` column can hold are
//! rejected the way the database rejects them, so callers cannot lean on sentinels
//! that only work in memory.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::db::models::{
    DailyStat, EventKind, LoadEvent, LoadSample, NewLoadEvent, NewSignature, STALE_DURATION, Signature,
};
use crate::db::store::{EdgeWrite, SignatureWrite, Store, StoreError};

/// 4713 BC, the earliest date PostgreSQL stores. Chrono's upper bound is below PostgreSQL's.
const PG_MIN_YEAR: i32 = -4712;

fn check_date(date: NaiveDate) -> Result<(), StoreError> {
    if date.year() < PG_MIN_YEAR {
        return Err(StoreError::Query(format!("date out of range: {}", date)));
    }
    Ok(())
}

fn check_time(ts: DateTime<Utc>) -> Result<(), StoreError> {
    if ts.year() < PG_MIN_YEAR {
        return Err(StoreError::Query(format!("timestamp out of range: {}", ts)));
    }
    Ok(())
}

type EdgeHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Default)]
struct Tables {
    samples: BTreeMap<DateTime<Utc>, LoadSample>,
    signatures: BTreeMap<i64, Signature>,
    events: BTreeMap<i64, LoadEvent>,
    daily_stats: BTreeMap<(NaiveDate, i64), DailyStat>,
    next_signature_id: i64,
    next_event_id: i64,
}

impl Tables {
    fn add_daily_stats(&mut self, date: NaiveDate, signature_id: i64, cycles: i64, duration: i64, energy_kwh: f64) {
        let row = self.daily_stats.entry((date, signature_id)).or_insert(DailyStat {
            date,
            signature_id,
            cycles: 0,
            total_duration: 0,
            energy_kwh: 0.0,
        });
        row.cycles += cycles;
        row.total_duration += duration;
        row.energy_kwh += energy_kwh;
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    edges: AtomicUsize,
    edge_hook: Mutex<Option<EdgeHook>>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tables", &self.tables)
            .field("fail_writes", &self.fail_writes)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Query`] until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Call `hook` with the running total after every recorded edge.
    pub fn set_edge_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.edge_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Every stored event, oldest id first.
    pub fn all_events(&self) -> Vec<LoadEvent> {
        self.tables().map(|t| t.events.values().cloned().collect()).unwrap_or_default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Connection("memory store mutex poisoned".to_string()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Query("write rejected (simulated outage)".to_string()));
        }
        self.tables()
    }
}

impl Store for MemoryStore {
    fn put_sample(&self, sample: &LoadSample) -> Result<(), StoreError> {
        check_time(sample.time)?;
        self.writable()?.samples.insert(sample.time, sample.clone());
        Ok(())
    }

    fn list_samples(&self) -> Result<Vec<LoadSample>, StoreError> {
        Ok(self.tables()?.samples.values().cloned().collect())
    }

    fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        check_time(cutoff)?;
        let mut t = self.writable()?;
        let before = t.samples.len();
        t.samples.retain(|time, _| *time >= cutoff);
        Ok(before - t.samples.len())
    }

    fn insert_signature(&self, row: &NewSignature) -> Result<Signature, StoreError> {
        let mut t = self.writable()?;
        t.next_signature_id += 1;
        let sig = row.clone().into_signature(t.next_signature_id);
        t.signatures.insert(sig.id, sig.clone());
        Ok(sig)
    }

    fn update_signature(&self, sig: &Signature) -> Result<(), StoreError> {
        let mut t = self.writable()?;
        match t.signatures.get_mut(&sig.id) {
            Some(existing) => {
                *existing = sig.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                table: "appliance_signatures",
                id: sig.id,
            }),
        }
    }

    fn get_signature(&self, id: i64) -> Result<Option<Signature>, StoreError> {
        Ok(self.tables()?.signatures.get(&id).cloned())
    }

    fn list_signatures(&self) -> Result<Vec<Signature>, StoreError> {
        Ok(self.tables()?.signatures.values().cloned().collect())
    }

    fn delete_signature(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.writable()?.signatures.remove(&id).is_some())
    }

    fn deactivate_all_signatures(&self) -> Result<usize, StoreError> {
        let mut t = self.writable()?;
        for sig in t.signatures.values_mut() {
            sig.is_active = false;
            sig.active_count = 0;
        }
        Ok(t.signatures.len())
    }

    fn insert_event(&self, row: &NewLoadEvent) -> Result<LoadEvent, StoreError> {
        check_time(row.time)?;
        let mut t = self.writable()?;
        t.next_event_id += 1;
        let event = row.clone().into_event(t.next_event_id);
        t.events.insert(event.id, event.clone());
        Ok(event)
    }

    fn update_event_duration(&self, id: i64, duration: i64) -> Result<(), StoreError> {
        let mut t = self.writable()?;
        match t.events.get_mut(&id) {
            Some(event) => {
                event.duration = Some(duration);
                Ok(())
            }
            None => Err(StoreError::NotFound { table: "load_events", id }),
        }
    }

    fn list_unresolved_on_events(&self, after: Option<DateTime<Utc>>) -> Result<Vec<LoadEvent>, StoreError> {
        if let Some(after) = after {
            check_time(after)?;
        }
        let t = self.tables()?;
        let mut rows: Vec<LoadEvent> = t
            .events
            .values()
            .filter(|e| e.event_type == EventKind::On && e.duration.is_none())
            .filter(|e| after.is_none_or(|after| e.time >= after))
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.time, e.id));
        Ok(rows)
    }

    fn expire_unresolved_on_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        check_time(before)?;
        let mut t = self.writable()?;
        let mut expired = 0;
        for event in t.events.values_mut() {
            if event.event_type == EventKind::On && event.duration.is_none() && event.time < before {
                event.duration = Some(STALE_DURATION);
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn list_events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LoadEvent>, StoreError> {
        check_time(since)?;
        let t = self.tables()?;
        let mut rows: Vec<LoadEvent> = t.events.values().filter(|e| e.time >= since).cloned().collect();
        rows.sort_by(|a, b| b.time.cmp(&a.time).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn reassign_events(&self, from_signature: i64, to_signature: i64) -> Result<usize, StoreError> {
        let mut t = self.writable()?;
        let mut moved = 0;
        for event in t.events.values_mut().filter(|e| e.signature_id == from_signature) {
            event.signature_id = to_signature;
            moved += 1;
        }
        Ok(moved)
    }

    fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        check_time(cutoff)?;
        let mut t = self.writable()?;
        let before = t.events.len();
        t.events.retain(|_, e| e.time >= cutoff);
        Ok(before - t.events.len())
    }

    fn upsert_daily_stats(
        &self,
        date: NaiveDate,
        signature_id: i64,
        cycles_delta: i64,
        duration_delta: i64,
        energy_delta: f64,
    ) -> Result<(), StoreError> {
        check_date(date)?;
        self.writable()?
            .add_daily_stats(date, signature_id, cycles_delta, duration_delta, energy_delta);
        Ok(())
    }

    fn list_daily_stats(&self, signature_id: i64, since: Option<NaiveDate>) -> Result<Vec<DailyStat>, StoreError> {
        if let Some(since) = since {
            check_date(since)?;
        }
        let t = self.tables()?;
        Ok(t.daily_stats
            .values()
            .rev()
            .filter(|row| row.signature_id == signature_id && since.is_none_or(|since| row.date >= since))
            .cloned()
            .collect())
    }

    fn delete_daily_stats(&self, signature_id: i64) -> Result<usize, StoreError> {
        let mut t = self.writable()?;
        let before = t.daily_stats.len();
        t.daily_stats.retain(|(_, sig), _| *sig != signature_id);
        Ok(before - t.daily_stats.len())
    }

    fn record_edge(&self, write: &EdgeWrite) -> Result<(Signature, LoadEvent), StoreError> {
        check_time(write.event.time)?;
        if let Some(cycle) = write.cycle {
            check_date(cycle.date)?;
        }

        let recorded = {
            let mut t = self.writable()?;
            // every lookup first, so a failure leaves nothing half-written
            let missing_signature = match &write.signature {
                SignatureWrite::Update(sig) => Some(sig.id),
                SignatureWrite::Create(_) => None,
            }
            .into_iter()
            .chain(write.released.as_ref().map(|s| s.id))
            .find(|id| !t.signatures.contains_key(id));
            if let Some(id) = missing_signature {
                return Err(StoreError::NotFound {
                    table: "appliance_signatures",
                    id,
                });
            }
            if let Some((on_id, _)) = write.closes
                && !t.events.contains_key(&on_id)
            {
                return Err(StoreError::NotFound {
                    table: "load_events",
                    id: on_id,
                });
            }

            let sig = match &write.signature {
                SignatureWrite::Create(row) => {
                    t.next_signature_id += 1;
                    row.clone().into_signature(t.next_signature_id)
                }
                SignatureWrite::Update(sig) => sig.clone(),
            };
            t.signatures.insert(sig.id, sig.clone());
            if let Some(other) = &write.released {
                t.signatures.insert(other.id, other.clone());
            }
            if let Some((on_id, secs)) = write.closes
                && let Some(on) = t.events.get_mut(&on_id)
            {
                on.duration = Some(secs);
            }
            if let Some(cycle) = write.cycle {
                t.add_daily_stats(cycle.date, sig.id, 1, cycle.duration, cycle.energy_kwh);
            }
            t.next_event_id += 1;
            let event = NewLoadEvent {
                signature_id: sig.id,
                ..write.event.clone()
            }
            .into_event(t.next_event_id);
            t.events.insert(event.id, event.clone());
            (sig, event)
        };

        let edges = self.edges.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(guard) = self.edge_hook.lock()
            && let Some(hook) = guard.as_ref()
        {
            hook(edges);
        }
        Ok(recorded)
    }

    fn clear_derived(&self) -> Result<(), StoreError> {
        let mut t = self.writable()?;
        t.events.clear();
        t.signatures.clear();
        t.daily_stats.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Leg;
    use crate::nilm::signatures::new_signature;
    use chrono::TimeZone;

    fn on_event(time: DateTime<Utc>) -> NewLoadEvent {
        NewLoadEvent {
            time,
            event_type: EventKind::On,
            power_delta: 150.0,
            leg: Leg::Both,
            duration: None,
            signature_id: 0,
            confidence: 0.88,
        }
    }

    #[test]
    fn rejects_bounds_postgres_cannot_store() {
        let store = MemoryStore::new();
        assert!(store.list_unresolved_on_events(Some(DateTime::<Utc>::MIN_UTC)).is_err());
        assert!(store.list_daily_stats(1, Some(NaiveDate::MIN)).is_err());
        assert!(store.delete_events_before(DateTime::<Utc>::MIN_UTC).is_err());

        assert!(store.list_unresolved_on_events(None).unwrap().is_empty());
        assert!(store.list_daily_stats(1, None).unwrap().is_empty());
    }

    #[test]
    fn failed_edge_writes_nothing() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let sig = store.insert_signature(&new_signature(150.0, Leg::Both)).unwrap();
        let on = store
            .insert_event(&NewLoadEvent {
                signature_id: sig.id,
                ..on_event(t0)
            })
            .unwrap();

        let mut ghost = sig.clone();
        ghost.id = 999;
        let write = EdgeWrite {
            signature: SignatureWrite::Update(sig.clone()),
            released: Some(ghost),
            closes: Some((on.id, 600)),
            cycle: None,
            event: on_event(t0 + chrono::Duration::minutes(10)),
        };
        assert!(matches!(
            store.record_edge(&write),
            Err(StoreError::NotFound { id: 999, .. })
        ));
        assert_eq!(store.all_events(), vec![on.clone()]);

        let write = EdgeWrite { released: None, ..write };
        let (_, off) = store.record_edge(&write).unwrap();
        assert_eq!(off.signature_id, sig.id);
        assert_eq!(store.all_events()[0].duration, Some(600));
    }
}
