//! Per-day usage totals for each appliance.

use chrono::{DateTime, Utc};

use crate::db::models::{DailyStat, Signature};
use crate::db::store::CycleDelta;
use crate::utils::round_to;

/// Energy of one cycle at a constant step, in kWh (four decimals).
pub fn energy_kwh(power_w: f64, duration_secs: i64) -> f64 {
    round_to(power_w * duration_secs as f64 / 3600.0 / 1000.0, 4)
}

/// Mean cycles per recorded day, one decimal. `None` without any rows.
pub fn mean_daily_cycles(days: &[DailyStat]) -> Option<f64> {
    if days.is_empty() {
        return None;
    }
    let cycles: i64 = days.iter().map(|d| d.cycles).sum();
    Some(round_to(cycles as f64 / days.len() as f64, 1))
}

/// The daily totals one finished cycle adds, booked on the calendar day (UTC) of its
/// "off" event. `days` are the signature's rows so far; `sig.daily_cycles` is
/// refreshed as if the cycle were already stored.
pub fn plan_cycle(
    sig: &mut Signature,
    mut days: Vec<DailyStat>,
    off_time: DateTime<Utc>,
    power_w: f64,
    duration_secs: i64,
) -> CycleDelta {
    let date = off_time.date_naive();
    match days.iter_mut().find(|d| d.date == date) {
        Some(day) => day.cycles += 1,
        None => days.push(DailyStat {
            date,
            signature_id: sig.id,
            cycles: 1,
            total_duration: duration_secs,
            energy_kwh: 0.0,
        }),
    }
    if let Some(mean) = mean_daily_cycles(&days) {
        sig.daily_cycles = mean;
    }
    CycleDelta {
        date,
        duration: duration_secs,
        energy_kwh: energy_kwh(power_w, duration_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::Leg;
    use crate::db::store::Store;
    use crate::nilm::signatures::new_signature;
    use chrono::TimeZone;

    #[test]
    fn energy_is_rounded_kwh() {
        assert_eq!(energy_kwh(150.0, 600), 0.025);
        assert_eq!(energy_kwh(2000.0, 90), 0.05);
        assert_eq!(energy_kwh(33.0, 7), 0.0001);
    }

    #[test]
    fn cycles_accumulate_per_day() {
        let store = MemoryStore::new();
        let mut sig = store.insert_signature(&new_signature(150.0, Leg::Both)).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 5, 2, 23, 59, 0).unwrap();

        for (off, secs) in [(day1, 600), (day1, 600), (day2, 1200)] {
            let days = store.list_daily_stats(sig.id, None).unwrap();
            let cycle = plan_cycle(&mut sig, days, off, 150.0, secs);
            store
                .upsert_daily_stats(cycle.date, sig.id, 1, cycle.duration, cycle.energy_kwh)
                .unwrap();
        }

        let days = store.list_daily_stats(sig.id, Some(day1.date_naive())).unwrap();
        assert_eq!(days.len(), 2);
        // newest first
        assert_eq!(days[0].date, day2.date_naive());
        assert_eq!(days[0].cycles, 1);
        assert_eq!(days[1].cycles, 2);
        assert_eq!(days[1].total_duration, 1200);
        assert!((days[1].energy_kwh - 0.05).abs() < 1e-9);
        assert_eq!(sig.daily_cycles, 1.5);
    }

    #[test]
    fn first_cycle_of_a_new_signature() {
        let mut sig = new_signature(2000.0, Leg::L2).into_signature(0);
        let off = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let cycle = plan_cycle(&mut sig, Vec::new(), off, 2000.0, 90);
        assert_eq!(cycle.date, off.date_naive());
        assert_eq!(cycle.energy_kwh, 0.05);
        assert_eq!(sig.daily_cycles, 1.0);
        assert_eq!(mean_daily_cycles(&[]), None);
    }
}
