//! Persistence interface the engine runs against.
//!
//! Each call is atomic on its own; the engine never needs a transaction that spans
//! calls. All mutating engine paths are serialized by the engine itself, so
//! implementations only need to be safe for concurrent readers.

use chrono::{DateTime, NaiveDate, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::db::models::{DailyStat, LoadEvent, LoadSample, NewLoadEvent, NewSignature, Signature};

/// The step's own signature, either already stored or about to be created.
#[derive(Debug, Clone)]
pub enum SignatureWrite {
    Create(NewSignature),
    Update(Signature),
}

/// One finished cycle to add to the daily totals of the step's signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleDelta {
    pub date: NaiveDate,
    pub duration: i64,
    pub energy_kwh: f64,
}

/// Every row an accepted edge touches. Applied all-or-nothing by
/// [`Store::record_edge`], so a failed edge can be retried from scratch.
#[derive(Debug, Clone)]
pub struct EdgeWrite {
    pub signature: SignatureWrite,
    /// Another signature released in place of the step's own.
    pub released: Option<Signature>,
    /// `(on event id, seconds)` closed by an "off".
    pub closes: Option<(i64, i64)>,
    pub cycle: Option<CycleDelta>,
    /// `signature_id` is ignored; the event is filed under the written signature.
    pub event: NewLoadEvent,
}

#[derive(Debug)]
pub enum StoreError {
    /// Could not reach or configure the backing database.
    Connection(String),
    /// A read or write failed (including statement timeouts).
    Query(String),
    /// A row that must exist for the operation was missing.
    NotFound { table: &'static str, id: i64 },
    /// A stored value could not be mapped back into a record.
    Corrupt(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "connection error: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
            StoreError::NotFound { table, id } => write!(f, "{} row {} not found", table, id),
            StoreError::Corrupt(e) => write!(f, "corrupt row: {}", e),
        }
    }
}

impl Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::DeserializationError(e) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<diesel::ConnectionError> for StoreError {
    fn from(value: diesel::ConnectionError) -> Self {
        StoreError::Connection(value.to_string())
    }
}

pub trait Store: Send + Sync {
    // Raw samples
    /// Insert or replace the sample at `sample.time`.
    fn put_sample(&self, sample: &LoadSample) -> Result<(), StoreError>;
    /// Every retained sample, oldest first.
    fn list_samples(&self) -> Result<Vec<LoadSample>, StoreError>;
    fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    // Signatures
    fn insert_signature(&self, row: &NewSignature) -> Result<Signature, StoreError>;
    /// Overwrite every column of an existing signature.
    fn update_signature(&self, sig: &Signature) -> Result<(), StoreError>;
    fn get_signature(&self, id: i64) -> Result<Option<Signature>, StoreError>;
    /// All signatures ordered by id.
    fn list_signatures(&self) -> Result<Vec<Signature>, StoreError>;
    fn delete_signature(&self, id: i64) -> Result<bool, StoreError>;
    /// Zero every active counter and flag.
    fn deactivate_all_signatures(&self) -> Result<usize, StoreError>;

    // Events
    fn insert_event(&self, row: &NewLoadEvent) -> Result<LoadEvent, StoreError>;
    fn update_event_duration(&self, id: i64, duration: i64) -> Result<(), StoreError>;
    /// "on" events with no duration (and `time >= after` when given), oldest first.
    fn list_unresolved_on_events(&self, after: Option<DateTime<Utc>>) -> Result<Vec<LoadEvent>, StoreError>;
    /// Stamp every unresolved "on" event older than `before` with the stale sentinel.
    fn expire_unresolved_on_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
    /// Events with `time >= since`, newest first, at most `limit` rows.
    fn list_events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LoadEvent>, StoreError>;
    fn reassign_events(&self, from_signature: i64, to_signature: i64) -> Result<usize, StoreError>;
    fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    // Daily stats
    /// Add the deltas to the `(date, signature_id)` row, creating it when missing.
    fn upsert_daily_stats(
        &self,
        date: NaiveDate,
        signature_id: i64,
        cycles_delta: i64,
        duration_delta: i64,
        energy_delta: f64,
    ) -> Result<(), StoreError>;
    /// Rows for one signature (with `date >= since` when given), newest first.
    fn list_daily_stats(&self, signature_id: i64, since: Option<NaiveDate>) -> Result<Vec<DailyStat>, StoreError>;
    fn delete_daily_stats(&self, signature_id: i64) -> Result<usize, StoreError>;

    /// Apply one edge atomically. Returns the signature and event as stored.
    fn record_edge(&self, write: &EdgeWrite) -> Result<(Signature, LoadEvent), StoreError>;

    /// Drop events, signatures and daily stats. Samples are kept.
    fn clear_derived(&self) -> Result<(), StoreError>;
}
