use chrono::NaiveDate;
use diesel::PgConnection;
use diesel::prelude::*;

use crate::db::models::{GroupPowerRow, MissingRow, PowerRow, RawPowerRow};
use crate::schema;

// PostgreSQL caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

fn chunk_rows(columns: usize) -> usize {
    MAX_BIND_PARAMS / columns
}

/// Delete every `power` row of `(site_id, day)` and insert `rows` in its place.
/// Callers are expected to run this inside a transaction.
pub fn replace_power_rows(
    conn: &mut PgConnection,
    site_id: &str,
    day: NaiveDate,
    rows: &[PowerRow],
) -> QueryResult<usize> {
    use schema::power::dsl as P;

    diesel::delete(P::power.filter(P::site_id.eq(site_id)).filter(P::day.eq(day))).execute(conn)?;

    let mut written = 0;
    for chunk in rows.chunks(chunk_rows(7)) {
        written += diesel::insert_into(P::power).values(chunk).execute(conn)?;
    }
    Ok(written)
}

pub fn replace_group_rows(
    conn: &mut PgConnection,
    group_id: &str,
    day: NaiveDate,
    rows: &[GroupPowerRow],
) -> QueryResult<usize> {
    use schema::group_power::dsl as G;

    diesel::delete(G::group_power.filter(G::group_id.eq(group_id)).filter(G::day.eq(day))).execute(conn)?;

    let mut written = 0;
    for chunk in rows.chunks(chunk_rows(7)) {
        written += diesel::insert_into(G::group_power).values(chunk).execute(conn)?;
    }
    Ok(written)
}

pub fn replace_raw_rows(
    conn: &mut PgConnection,
    site_id: &str,
    day: NaiveDate,
    rows: &[RawPowerRow],
) -> QueryResult<usize> {
    use schema::raw_power::dsl as R;

    diesel::delete(R::raw_power.filter(R::site_id.eq(site_id)).filter(R::day.eq(day))).execute(conn)?;

    let mut written = 0;
    for chunk in rows.chunks(chunk_rows(6)) {
        written += diesel::insert_into(R::raw_power).values(chunk).execute(conn)?;
    }
    Ok(written)
}

/// Missing-tick rows of `(site_id, day)`; an empty `rows` clears a recovered day.
pub fn replace_missing_rows(
    conn: &mut PgConnection,
    site_id: &str,
    day: NaiveDate,
    rows: &[MissingRow],
) -> QueryResult<usize> {
    use schema::raw_missing::dsl as M;

    diesel::delete(M::raw_missing.filter(M::site_id.eq(site_id)).filter(M::day.eq(day))).execute(conn)?;

    let mut written = 0;
    for chunk in rows.chunks(chunk_rows(6)) {
        written += diesel::insert_into(M::raw_missing).values(chunk).execute(conn)?;
    }
    Ok(written)
}
