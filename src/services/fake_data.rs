//! Synthetic household load for demos and replay tests.
//!
//! Appliances run one at a time on top of a noisy idle load, with idle gaps long
//! enough for the detector to settle between switchings.

use chrono::{DateTime, Duration, Utc};
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;

use crate::db::models::{Leg, LoadSample};
use crate::db::store::{Store, StoreError};
use crate::nilm::smoothing::RollingWindow;
use crate::utils::round_to;

const DEMO_SEED: u64 = 0x0420_1337_DEAD_BEEF;
const SMOOTHING_WINDOW: usize = 3;

struct Appliance {
    name: &'static str,
    watts: f64,
    leg: Leg,
    run_secs: RangeInclusive<i64>,
    /// Relative pick frequency.
    weight: u32,
}

static APPLIANCES: [Appliance; 5] = [
    Appliance {
        name: "fridge",
        watts: 150.0,
        leg: Leg::L1,
        run_secs: 600..=1200,
        weight: 4,
    },
    Appliance {
        name: "lights",
        watts: 60.0,
        leg: Leg::L2,
        run_secs: 900..=3600,
        weight: 2,
    },
    Appliance {
        name: "washer",
        watts: 500.0,
        leg: Leg::Both,
        run_secs: 1800..=3600,
        weight: 1,
    },
    Appliance {
        name: "microwave",
        watts: 1100.0,
        leg: Leg::L1,
        run_secs: 120..=300,
        weight: 2,
    },
    Appliance {
        name: "kettle",
        watts: 2000.0,
        leg: Leg::L2,
        run_secs: 120..=240,
        weight: 1,
    },
];

#[derive(Debug, Clone)]
pub struct HouseholdProfile {
    pub start: DateTime<Utc>,
    pub hours: i64,
    pub step_secs: i64,
    pub idle_w: f64,
    /// Uniform jitter added to every reading, +/- watts.
    pub noise_w: f64,
    /// Quiet time between two appliance runs.
    pub gap_secs: RangeInclusive<i64>,
}

impl Default for HouseholdProfile {
    fn default() -> Self {
        let hours = 48;
        let now = Utc::now().timestamp();
        let start = DateTime::<Utc>::from_timestamp(now - now % 10, 0).unwrap_or_else(Utc::now) - Duration::hours(hours);
        HouseholdProfile {
            start,
            hours,
            step_secs: 10,
            idle_w: 70.0,
            noise_w: 4.0,
            gap_secs: 300..=1200,
        }
    }
}

/// A scheduled run in sample indices, `[from, to)`.
struct Run {
    from: usize,
    to: usize,
    appliance: &'static Appliance,
    watts: f64,
}

/// Write a deterministic synthetic history for `seed` into `store`. Returns the
/// number of samples written.
pub fn generate_household<S: Store + ?Sized>(
    store: &S,
    profile: &HouseholdProfile,
    seed: u64,
) -> Result<usize, StoreError> {
    let step = profile.step_secs.max(1);
    let total = (profile.hours * 3600 / step).max(0) as usize;
    let mut rng = SmallRng::seed_from_u64(seed);
    let runs = schedule(&mut rng, profile, total, step);

    info!(
        "Fake data: {} samples from {} ({} appliance runs)",
        total,
        profile.start,
        runs.len()
    );

    let mut window = RollingWindow::new(SMOOTHING_WINDOW);
    let mut next_run = 0;
    for index in 0..total {
        while next_run < runs.len() && runs[next_run].to <= index {
            next_run += 1;
        }
        let mut l1 = profile.idle_w / 2.0;
        let mut l2 = profile.idle_w / 2.0;
        if let Some(run) = runs.get(next_run).filter(|r| r.from <= index) {
            match run.appliance.leg {
                Leg::L1 => l1 += run.watts,
                Leg::L2 => l2 += run.watts,
                Leg::Both => {
                    l1 += run.watts / 2.0;
                    l2 += run.watts / 2.0;
                }
            }
        }
        let noise = rng.random_range(-profile.noise_w..=profile.noise_w);
        l1 = round_to(l1 + noise / 2.0, 1);
        l2 = round_to(l2 + noise / 2.0, 1);
        let load_total = round_to(l1 + l2, 1);
        window.push(load_total);

        store.put_sample(&LoadSample {
            time: profile.start + Duration::seconds(index as i64 * step),
            load_total,
            load_l1: l1,
            load_l2: l2,
            smoothed_total: round_to(window.mean(), 1),
        })?;
    }

    Ok(total)
}

fn schedule(rng: &mut SmallRng, profile: &HouseholdProfile, total: usize, step: i64) -> Vec<Run> {
    let weight_sum: u32 = APPLIANCES.iter().map(|a| a.weight).sum();
    let mut runs = Vec::new();
    let mut cursor = 0usize;
    loop {
        cursor += (rng.random_range(profile.gap_secs.clone()) / step).max(1) as usize;
        let appliance = pick(rng.random_range(0..weight_sum));
        let length = (rng.random_range(appliance.run_secs.clone()) / step).max(1) as usize;
        if cursor + length >= total {
            break;
        }
        runs.push(Run {
            from: cursor,
            to: cursor + length,
            appliance,
            watts: round_to(appliance.watts * rng.random_range(0.98..=1.02), 1),
        });
        cursor += length;
    }
    runs
}

fn pick(mut roll: u32) -> &'static Appliance {
    for appliance in &APPLIANCES {
        if roll < appliance.weight {
            return appliance;
        }
        roll -= appliance.weight;
    }
    &APPLIANCES[0]
}

/// Fill the sample table with two days of demo data ending now.
pub fn run<S: Store + ?Sized>(store: &S) -> Result<usize, String> {
    let profile = HouseholdProfile::default();
    let written = generate_household(store, &profile, DEMO_SEED).map_err(|e| format!("fake data failed: {}", e))?;
    let names: Vec<&str> = APPLIANCES.iter().map(|a| a.name).collect();
    info!("Fake data: complete ({} samples; appliances: {})", written, names.join(", "));
    Ok(written)
}
