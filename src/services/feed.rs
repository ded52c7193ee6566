//! Live ingestion from a line-oriented reading stream.
//!
//! Each line is `total[,leg1[,leg2]]` in watts. Detected events are written to `out`
//! as one JSON object per line. Store failures are logged and the stream continues;
//! the next reading retries against the unchanged detector state.

use log::{debug, info, warn};
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use crate::db::store::Store;
use crate::nilm::NilmEngine;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub total: f64,
    pub leg1: Option<f64>,
    pub leg2: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub readings: usize,
    pub events: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// `Ok(None)` for blank lines and `#` comments.
pub fn parse_reading(line: &str) -> Result<Option<Reading>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split(',').map(str::trim);
    let total = parse_watts(fields.next().unwrap_or_default(), "total")?
        .ok_or_else(|| "missing total load".to_string())?;
    let leg1 = parse_watts(fields.next().unwrap_or_default(), "leg1")?;
    let leg2 = parse_watts(fields.next().unwrap_or_default(), "leg2")?;
    if fields.next().is_some() {
        return Err(format!("too many fields in {:?}", line));
    }
    Ok(Some(Reading { total, leg1, leg2 }))
}

fn parse_watts(field: &str, name: &str) -> Result<Option<f64>, String> {
    if field.is_empty() {
        return Ok(None);
    }
    let value: f64 = field
        .parse()
        .map_err(|_| format!("{} is not a number: {:?}", name, field))?;
    if !value.is_finite() {
        return Err(format!("{} is not finite: {:?}", name, field));
    }
    Ok(Some(value))
}

pub fn run_loop<S: Store, R: BufRead, W: Write>(
    engine: &NilmEngine<S>,
    input: R,
    mut out: W,
    cleanup_interval: Duration,
) -> Result<FeedStats, String> {
    let mut stats = FeedStats::default();
    let mut last_cleanup = Instant::now();

    for (index, line) in input.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read input line {}: {}", index + 1, e))?;
        let reading = match parse_reading(&line) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping line {}: {}", index + 1, e);
                stats.rejected += 1;
                continue;
            }
        };
        stats.readings += 1;

        let smoothed = match engine.ingest(reading.total, reading.leg1, reading.leg2) {
            Ok(s) => s,
            Err(e) => {
                warn!("Storing reading failed: {}", e);
                stats.failed += 1;
                continue;
            }
        };
        match engine.detect(smoothed, reading.leg1, reading.leg2, None) {
            Ok(Some(detected)) => {
                stats.events += 1;
                let json = serde_json::to_string(&detected).map_err(|e| format!("encode event failed: {}", e))?;
                writeln!(out, "{}", json).map_err(|e| format!("write event failed: {}", e))?;
                out.flush().map_err(|e| format!("write event failed: {}", e))?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Detection failed: {}", e);
                stats.failed += 1;
            }
        }

        if last_cleanup.elapsed() >= cleanup_interval {
            if let Err(e) = engine.cleanup() {
                warn!("Retention cleanup failed: {}", e);
            }
            last_cleanup = Instant::now();
        }
    }

    debug!("Input closed after {} line(s)", stats.readings + stats.rejected);
    info!(
        "Feed finished: {} reading(s), {} event(s), {} rejected, {} failed",
        stats.readings, stats.events, stats.rejected, stats.failed
    );
    Ok(stats)
}
