//! Diesel model structs for the load monitoring tables.
//!
//! `load_samples` is the raw append-only log shared with the host's retention policy.
//! The remaining tables are derived state owned by the engine and may be wiped and
//! rebuilt by a reanalysis.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::schema;

/// Duration written to an "on" event that was never paired and has been given up on.
pub const STALE_DURATION: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    On,
    Off,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::On => "on",
            EventKind::Off => "off",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(EventKind::On),
            "off" => Ok(EventKind::Off),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// Which supply leg carried the step change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
pub enum Leg {
    L1,
    L2,
    #[serde(rename = "both")]
    Both,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::L1 => "L1",
            Leg::L2 => "L2",
            Leg::Both => "both",
        }
    }
}

impl Display for Leg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Leg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1" => Ok(Leg::L1),
            "L2" => Ok(Leg::L2),
            "both" => Ok(Leg::Both),
            other => Err(format!("unknown leg: {}", other)),
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql<Text, Pg> for $ty {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<Text, Pg> for $ty {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                raw.parse::<$ty>().map_err(Into::into)
            }
        }
    };
}

text_enum_sql!(EventKind);
text_enum_sql!(Leg);

// Raw log: load_samples
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::load_samples)]
pub struct LoadSample {
    pub time: DateTime<Utc>,
    pub load_total: f64,
    pub load_l1: f64,
    pub load_l2: f64,
    pub smoothed_total: f64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::appliance_signatures)]
#[diesel(treat_none_as_null = true)]
pub struct Signature {
    pub id: i64,
    pub power_avg: f64,
    pub power_min: f64,
    pub power_max: f64,
    pub leg_pattern: Leg,
    pub event_count: i64,
    pub user_label: String,
    pub icon: String,
    pub color: String,
    pub is_active: bool,
    /// Concurrently running instances ("Lamp x2").
    pub active_count: i32,
    pub last_on_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub avg_duration: f64,
    pub daily_cycles: f64,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::appliance_signatures)]
pub struct NewSignature {
    pub power_avg: f64,
    pub power_min: f64,
    pub power_max: f64,
    pub leg_pattern: Leg,
    pub event_count: i64,
    pub user_label: String,
    pub icon: String,
    pub color: String,
    pub is_active: bool,
    pub active_count: i32,
    pub last_on_time: Option<DateTime<Utc>>,
    pub avg_duration: f64,
    pub daily_cycles: f64,
}

impl NewSignature {
    pub fn into_signature(self, id: i64) -> Signature {
        Signature {
            id,
            power_avg: self.power_avg,
            power_min: self.power_min,
            power_max: self.power_max,
            leg_pattern: self.leg_pattern,
            event_count: self.event_count,
            user_label: self.user_label,
            icon: self.icon,
            color: self.color,
            is_active: self.is_active,
            active_count: self.active_count,
            last_on_time: self.last_on_time,
            avg_duration: self.avg_duration,
            daily_cycles: self.daily_cycles,
        }
    }
}

impl From<&Signature> for NewSignature {
    fn from(sig: &Signature) -> Self {
        NewSignature {
            power_avg: sig.power_avg,
            power_min: sig.power_min,
            power_max: sig.power_max,
            leg_pattern: sig.leg_pattern,
            event_count: sig.event_count,
            user_label: sig.user_label.clone(),
            icon: sig.icon.clone(),
            color: sig.color.clone(),
            is_active: sig.is_active,
            active_count: sig.active_count,
            last_on_time: sig.last_on_time,
            avg_duration: sig.avg_duration,
            daily_cycles: sig.daily_cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::load_events)]
pub struct LoadEvent {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub event_type: EventKind,
    /// Always positive; the direction lives in `event_type`.
    pub power_delta: f64,
    pub leg: Leg,
    /// Seconds. `None` until paired, [`STALE_DURATION`] once expired.
    pub duration: Option<i64>,
    pub signature_id: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::load_events)]
pub struct NewLoadEvent {
    pub time: DateTime<Utc>,
    pub event_type: EventKind,
    pub power_delta: f64,
    pub leg: Leg,
    pub duration: Option<i64>,
    pub signature_id: i64,
    pub confidence: f64,
}

impl NewLoadEvent {
    pub fn into_event(self, id: i64) -> LoadEvent {
        LoadEvent {
            id,
            time: self.time,
            event_type: self.event_type,
            power_delta: self.power_delta,
            leg: self.leg,
            duration: self.duration,
            signature_id: self.signature_id,
            confidence: self.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::appliance_daily_stats)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub signature_id: i64,
    pub cycles: i64,
    /// Seconds.
    pub total_duration: i64,
    pub energy_kwh: f64,
}
