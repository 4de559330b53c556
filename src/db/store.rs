//! PostgreSQL/TimescaleDB implementation of the persistence and configuration contracts.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::PgConnection;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, info};
use std::collections::BTreeMap;

use crate::configuration::{ConfigRow, ConfigStore, SiteGroup};
use crate::db::models::{
    GroupPowerRow, MissingRow, PowerRow, RawPowerRow, SensorConfigRow, SiteGroupRow, SyncMarkerRow,
};
use crate::schema;
use crate::services::ingest;
use crate::store::{MissingRecord, PowerRecord, PowerStore, RawPowerRecord, RecordScope, SiteDayBatch, StoreError};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().max_size(max_size).build(manager)?;
        Ok(PgStore { pool })
    }

    pub fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Applies pending embedded migrations, returning their names.
    pub fn run_migrations(&self) -> Result<Vec<String>, String> {
        let mut conn = self.conn().map_err(|e| e.to_string())?;
        conn.run_pending_migrations(MIGRATIONS)
            .map(|applied| applied.iter().map(|m| m.to_string()).collect())
            .map_err(|e| format!("Applying database migrations failed: {}", e))
    }
}

impl PowerStore for PgStore {
    fn replace_site_day(&self, batch: &SiteDayBatch) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let written = conn.transaction::<usize, StoreError, _>(|conn| match batch.scope {
            RecordScope::Site => {
                let power: Vec<PowerRow> = batch.power.iter().map(|r| PowerRow::new(r, batch.config_id)).collect();
                let raw: Vec<RawPowerRow> = batch.raw.iter().map(|r| RawPowerRow::new(r, batch.config_id)).collect();
                let missing: Vec<MissingRow> =
                    batch.missing.iter().map(|r| MissingRow::new(r, batch.config_id)).collect();
                let written = ingest::replace_power_rows(conn, &batch.site_id, batch.day, &power)?;
                let raw_written = ingest::replace_raw_rows(conn, &batch.site_id, batch.day, &raw)?;
                let gaps = ingest::replace_missing_rows(conn, &batch.site_id, batch.day, &missing)?;
                debug!(
                    "Store: site {} day {} -> {} power rows, {} raw rows, {} gap rows",
                    batch.site_id, batch.day, written, raw_written, gaps
                );
                Ok(written)
            }
            RecordScope::Group => {
                let power: Vec<GroupPowerRow> =
                    batch.power.iter().map(|r| GroupPowerRow::new(r, batch.config_id)).collect();
                Ok(ingest::replace_group_rows(conn, &batch.site_id, batch.day, &power)?)
            }
        })?;
        Ok(written)
    }

    fn load_site_day(&self, scope: RecordScope, site_id: &str, day: NaiveDate) -> Result<Vec<PowerRecord>, StoreError> {
        let mut conn = self.conn()?;
        match scope {
            RecordScope::Site => {
                use schema::power::dsl as P;
                let rows = P::power
                    .filter(P::site_id.eq(site_id))
                    .filter(P::day.eq(day))
                    .order(P::ts.asc())
                    .select(PowerRow::as_select())
                    .load::<PowerRow>(&mut conn)?;
                Ok(rows.into_iter().map(PowerRow::into_record).collect())
            }
            RecordScope::Group => {
                use schema::group_power::dsl as G;
                let rows = G::group_power
                    .filter(G::group_id.eq(site_id))
                    .filter(G::day.eq(day))
                    .order(G::ts.asc())
                    .select(GroupPowerRow::as_select())
                    .load::<GroupPowerRow>(&mut conn)?;
                Ok(rows.into_iter().map(GroupPowerRow::into_record).collect())
            }
        }
    }

    fn last_synced_day(&self, site_id: &str) -> Result<Option<NaiveDate>, StoreError> {
        use schema::sync_markers::dsl as M;
        let mut conn = self.conn()?;
        Ok(M::sync_markers
            .filter(M::site_id.eq(site_id))
            .select(M::last_synced_day)
            .first::<NaiveDate>(&mut conn)
            .optional()?)
    }

    fn set_last_synced_day(&self, site_id: &str, day: NaiveDate) -> Result<(), StoreError> {
        use schema::sync_markers::dsl as M;
        let mut conn = self.conn()?;
        let marker = SyncMarkerRow {
            site_id: site_id.to_string(),
            last_synced_day: day,
            updated_at: Utc::now(),
        };
        diesel::insert_into(M::sync_markers)
            .values(&marker)
            .on_conflict(M::site_id)
            .do_update()
            .set(&marker)
            .execute(&mut conn)?;
        Ok(())
    }

    fn gap_days(&self, site_id: &str, from: NaiveDate, until: NaiveDate) -> Result<Vec<NaiveDate>, StoreError> {
        use schema::raw_missing::dsl as M;
        let mut conn = self.conn()?;
        Ok(M::raw_missing
            .filter(M::site_id.eq(site_id))
            .filter(M::day.ge(from))
            .filter(M::day.lt(until))
            .select(M::day)
            .distinct()
            .order(M::day.asc())
            .load::<NaiveDate>(&mut conn)?)
    }

    fn raw_days(&self, site_id: &str) -> Result<Vec<NaiveDate>, StoreError> {
        use schema::raw_power::dsl as R;
        let mut conn = self.conn()?;
        Ok(R::raw_power
            .filter(R::site_id.eq(site_id))
            .select(R::day)
            .distinct()
            .order(R::day.asc())
            .load::<NaiveDate>(&mut conn)?)
    }

    fn load_raw_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<RawPowerRecord>, StoreError> {
        use schema::raw_power::dsl as R;
        let mut conn = self.conn()?;
        let rows = R::raw_power
            .filter(R::site_id.eq(site_id))
            .filter(R::day.eq(day))
            .order((R::sensor_id.asc(), R::ts.asc()))
            .select(RawPowerRow::as_select())
            .load::<RawPowerRow>(&mut conn)?;
        Ok(rows.into_iter().map(RawPowerRow::into_record).collect())
    }

    fn load_missing_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<MissingRecord>, StoreError> {
        use schema::raw_missing::dsl as M;
        let mut conn = self.conn()?;
        let rows = M::raw_missing
            .filter(M::site_id.eq(site_id))
            .filter(M::day.eq(day))
            .order(M::sensor_id.asc())
            .select(MissingRow::as_select())
            .load::<MissingRow>(&mut conn)?;
        Ok(rows.into_iter().map(MissingRow::into_record).collect())
    }
}

impl ConfigStore for PgStore {
    fn load_config_rows(&self) -> Result<Vec<(DateTime<Utc>, ConfigRow)>, StoreError> {
        use schema::sensors_config::dsl as C;
        let mut conn = self.conn()?;
        let rows = C::sensors_config
            .order((C::insertion_time.asc(), C::site_id.asc(), C::sensor_id.asc()))
            .select(SensorConfigRow::as_select())
            .load::<SensorConfigRow>(&mut conn)?;
        Ok(rows.into_iter().map(SensorConfigRow::into_parts).collect())
    }

    fn latest_insertion_times(&self) -> Result<Vec<(String, String, DateTime<Utc>)>, StoreError> {
        use schema::sensors_config::dsl as C;
        let mut conn = self.conn()?;
        let rows = C::sensors_config
            .group_by((C::site_id, C::sensor_id))
            .select((C::site_id, C::sensor_id, max(C::insertion_time)))
            .load::<(String, String, Option<DateTime<Utc>>)>(&mut conn)?;
        Ok(rows
            .into_iter()
            .filter_map(|(site, sensor, latest)| latest.map(|t| (site, sensor, t)))
            .collect())
    }

    fn load_config_version(&self, config_id: DateTime<Utc>) -> Result<Vec<ConfigRow>, StoreError> {
        use schema::sensors_config::dsl as C;
        let mut conn = self.conn()?;
        let rows = C::sensors_config
            .filter(C::insertion_time.eq(config_id))
            .order((C::site_id.asc(), C::sensor_id.asc()))
            .select(SensorConfigRow::as_select())
            .load::<SensorConfigRow>(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.into_parts().1).collect())
    }

    fn insert_config_rows(&self, config_id: DateTime<Utc>, rows: &[ConfigRow]) -> Result<(), StoreError> {
        use schema::sensors_config::dsl as C;
        let mut conn = self.conn()?;
        let new_rows: Vec<SensorConfigRow> = rows.iter().map(|r| SensorConfigRow::new(config_id, r)).collect();
        let inserted = diesel::insert_into(C::sensors_config).values(&new_rows).execute(&mut conn)?;
        info!("Config: stored {} rows for version {}", inserted, config_id.to_rfc3339());
        Ok(())
    }

    fn load_site_groups(&self) -> Result<Vec<SiteGroup>, StoreError> {
        use schema::site_groups::dsl as S;
        let mut conn = self.conn()?;
        let rows = S::site_groups
            .order((S::group_id.asc(), S::site_id.asc()))
            .select(SiteGroupRow::as_select())
            .load::<SiteGroupRow>(&mut conn)?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.group_id).or_default().push(row.site_id);
        }
        Ok(groups
            .into_iter()
            .map(|(group_id, site_ids)| SiteGroup { group_id, site_ids })
            .collect())
    }
}
