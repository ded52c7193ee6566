//! PostgreSQL-backed [`Store`] built on a single blocking diesel connection.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, info};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::db::models::{
    DailyStat, EventKind, LoadEvent, LoadSample, NewLoadEvent, NewSignature, STALE_DURATION, Signature,
};
use crate::db::store::{EdgeWrite, SignatureWrite, Store, StoreError};
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub struct PgStore {
    conn: Mutex<PgConnection>,
}

impl PgStore {
    /// Connect and bound every statement by `statement_timeout` so a stuck database
    /// surfaces as an error instead of blocking the sample path.
    pub fn connect(database_url: &str, statement_timeout: Duration) -> Result<Self, StoreError> {
        let mut conn = PgConnection::establish(database_url)?;
        diesel::sql_query(format!("SET statement_timeout = {}", statement_timeout.as_millis()))
            .execute(&mut conn)
            .map_err(|e| StoreError::Connection(format!("set statement_timeout failed: {}", e)))?;
        debug!("statement_timeout set to {}ms", statement_timeout.as_millis());
        Ok(PgStore { conn: Mutex::new(conn) })
    }

    pub fn apply_migrations(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        match conn.run_pending_migrations(MIGRATIONS) {
            Ok(applied) => {
                if applied.is_empty() {
                    info!("Database schema is up to date; no migrations were applied");
                } else {
                    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                    info!("Applied {} database migration(s): {}", applied.len(), names);
                }
                Ok(())
            }
            Err(e) => Err(StoreError::Connection(format!("applying database migrations failed: {}", e))),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, PgConnection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connection("connection mutex poisoned".to_string()))
    }
}

/// Add `row`'s counters onto the existing `(date, signature_id)` row.
fn add_daily_stats(conn: &mut PgConnection, row: &DailyStat) -> Result<(), diesel::result::Error> {
    use schema::appliance_daily_stats::dsl as D;

    diesel::insert_into(D::appliance_daily_stats)
        .values(row)
        .on_conflict((D::date, D::signature_id))
        .do_update()
        .set((
            D::cycles.eq(D::cycles + excluded(D::cycles)),
            D::total_duration.eq(D::total_duration + excluded(D::total_duration)),
            D::energy_kwh.eq(D::energy_kwh + excluded(D::energy_kwh)),
        ))
        .execute(conn)?;
    Ok(())
}

impl Store for PgStore {
    fn put_sample(&self, sample: &LoadSample) -> Result<(), StoreError> {
        use schema::load_samples::dsl as S;

        let mut conn = self.conn()?;
        diesel::insert_into(S::load_samples)
            .values(sample)
            .on_conflict(S::time)
            .do_update()
            .set((
                S::load_total.eq(excluded(S::load_total)),
                S::load_l1.eq(excluded(S::load_l1)),
                S::load_l2.eq(excluded(S::load_l2)),
                S::smoothed_total.eq(excluded(S::smoothed_total)),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn list_samples(&self) -> Result<Vec<LoadSample>, StoreError> {
        use schema::load_samples::dsl as S;

        let mut conn = self.conn()?;
        let rows = S::load_samples
            .order(S::time.asc())
            .select(LoadSample::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::load_samples::dsl as S;

        let mut conn = self.conn()?;
        Ok(diesel::delete(S::load_samples.filter(S::time.lt(cutoff))).execute(&mut *conn)?)
    }

    fn insert_signature(&self, row: &NewSignature) -> Result<Signature, StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        let sig = diesel::insert_into(G::appliance_signatures)
            .values(row)
            .returning(Signature::as_returning())
            .get_result(&mut *conn)?;
        Ok(sig)
    }

    fn update_signature(&self, sig: &Signature) -> Result<(), StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        let updated = diesel::update(G::appliance_signatures.find(sig.id))
            .set(sig)
            .execute(&mut *conn)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                table: "appliance_signatures",
                id: sig.id,
            });
        }
        Ok(())
    }

    fn get_signature(&self, id: i64) -> Result<Option<Signature>, StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        let sig = G::appliance_signatures
            .find(id)
            .select(Signature::as_select())
            .first(&mut *conn)
            .optional()?;
        Ok(sig)
    }

    fn list_signatures(&self) -> Result<Vec<Signature>, StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        let rows = G::appliance_signatures
            .order(G::id.asc())
            .select(Signature::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    fn delete_signature(&self, id: i64) -> Result<bool, StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        let deleted = diesel::delete(G::appliance_signatures.find(id)).execute(&mut *conn)?;
        Ok(deleted > 0)
    }

    fn deactivate_all_signatures(&self) -> Result<usize, StoreError> {
        use schema::appliance_signatures::dsl as G;

        let mut conn = self.conn()?;
        Ok(diesel::update(G::appliance_signatures)
            .set((G::is_active.eq(false), G::active_count.eq(0)))
            .execute(&mut *conn)?)
    }

    fn insert_event(&self, row: &NewLoadEvent) -> Result<LoadEvent, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        let event = diesel::insert_into(E::load_events)
            .values(row)
            .returning(LoadEvent::as_returning())
            .get_result(&mut *conn)?;
        Ok(event)
    }

    fn update_event_duration(&self, id: i64, duration: i64) -> Result<(), StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        let updated = diesel::update(E::load_events.find(id))
            .set(E::duration.eq(Some(duration)))
            .execute(&mut *conn)?;
        if updated == 0 {
            return Err(StoreError::NotFound { table: "load_events", id });
        }
        Ok(())
    }

    fn list_unresolved_on_events(&self, after: Option<DateTime<Utc>>) -> Result<Vec<LoadEvent>, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        let mut query = E::load_events
            .filter(E::event_type.eq(EventKind::On).and(E::duration.is_null()))
            .into_boxed();
        if let Some(after) = after {
            query = query.filter(E::time.ge(after));
        }
        let rows = query
            .order((E::time.asc(), E::id.asc()))
            .select(LoadEvent::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    fn expire_unresolved_on_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        Ok(diesel::update(
            E::load_events.filter(
                E::event_type
                    .eq(EventKind::On)
                    .and(E::duration.is_null())
                    .and(E::time.lt(before)),
            ),
        )
        .set(E::duration.eq(Some(STALE_DURATION)))
        .execute(&mut *conn)?)
    }

    fn list_events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LoadEvent>, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        let rows = E::load_events
            .filter(E::time.ge(since))
            .order((E::time.desc(), E::id.desc()))
            .limit(limit as i64)
            .select(LoadEvent::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    fn reassign_events(&self, from_signature: i64, to_signature: i64) -> Result<usize, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        Ok(diesel::update(E::load_events.filter(E::signature_id.eq(from_signature)))
            .set(E::signature_id.eq(to_signature))
            .execute(&mut *conn)?)
    }

    fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        Ok(diesel::delete(E::load_events.filter(E::time.lt(cutoff))).execute(&mut *conn)?)
    }

    fn upsert_daily_stats(
        &self,
        date: NaiveDate,
        signature_id: i64,
        cycles_delta: i64,
        duration_delta: i64,
        energy_delta: f64,
    ) -> Result<(), StoreError> {
        let row = DailyStat {
            date,
            signature_id,
            cycles: cycles_delta,
            total_duration: duration_delta,
            energy_kwh: energy_delta,
        };
        let mut conn = self.conn()?;
        add_daily_stats(&mut *conn, &row)?;
        Ok(())
    }

    fn list_daily_stats(&self, signature_id: i64, since: Option<NaiveDate>) -> Result<Vec<DailyStat>, StoreError> {
        use schema::appliance_daily_stats::dsl as D;

        let mut conn = self.conn()?;
        let mut query = D::appliance_daily_stats
            .filter(D::signature_id.eq(signature_id))
            .into_boxed();
        if let Some(since) = since {
            query = query.filter(D::date.ge(since));
        }
        let rows = query
            .order(D::date.desc())
            .select(DailyStat::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    fn delete_daily_stats(&self, signature_id: i64) -> Result<usize, StoreError> {
        use schema::appliance_daily_stats::dsl as D;

        let mut conn = self.conn()?;
        Ok(diesel::delete(D::appliance_daily_stats.filter(D::signature_id.eq(signature_id))).execute(&mut *conn)?)
    }

    fn record_edge(&self, write: &EdgeWrite) -> Result<(Signature, LoadEvent), StoreError> {
        use schema::appliance_signatures::dsl as G;
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        conn.transaction::<_, StoreError, _>(|conn| {
            let sig = match &write.signature {
                SignatureWrite::Create(row) => diesel::insert_into(G::appliance_signatures)
                    .values(row)
                    .returning(Signature::as_returning())
                    .get_result(conn)?,
                SignatureWrite::Update(sig) => diesel::update(G::appliance_signatures.find(sig.id))
                    .set(sig)
                    .returning(Signature::as_returning())
                    .get_result(conn)
                    .optional()?
                    .ok_or(StoreError::NotFound {
                        table: "appliance_signatures",
                        id: sig.id,
                    })?,
            };

            if let Some(other) = &write.released {
                let updated = diesel::update(G::appliance_signatures.find(other.id))
                    .set(other)
                    .execute(conn)?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        table: "appliance_signatures",
                        id: other.id,
                    });
                }
            }

            if let Some((on_id, secs)) = write.closes {
                let updated = diesel::update(E::load_events.find(on_id))
                    .set(E::duration.eq(Some(secs)))
                    .execute(conn)?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        table: "load_events",
                        id: on_id,
                    });
                }
            }

            if let Some(cycle) = write.cycle {
                add_daily_stats(
                    conn,
                    &DailyStat {
                        date: cycle.date,
                        signature_id: sig.id,
                        cycles: 1,
                        total_duration: cycle.duration,
                        energy_kwh: cycle.energy_kwh,
                    },
                )?;
            }

            let event = NewLoadEvent {
                signature_id: sig.id,
                ..write.event.clone()
            };
            let event = diesel::insert_into(E::load_events)
                .values(&event)
                .returning(LoadEvent::as_returning())
                .get_result(conn)?;
            Ok((sig, event))
        })
    }

    fn clear_derived(&self) -> Result<(), StoreError> {
        use schema::appliance_daily_stats::dsl as D;
        use schema::appliance_signatures::dsl as G;
        use schema::load_events::dsl as E;

        let mut conn = self.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let events = diesel::delete(E::load_events).execute(conn)?;
            let sigs = diesel::delete(G::appliance_signatures).execute(conn)?;
            let stats = diesel::delete(D::appliance_daily_stats).execute(conn)?;
            debug!("Cleared derived state (events={}, signatures={}, daily_stats={})", events, sigs, stats);
            Ok(())
        })?;
        Ok(())
    }
}
