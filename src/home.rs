//! Per-site aggregation of sensor power onto one uniform grid.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::configuration::{ConfigRow, Configuration, Roles};
use crate::error::{AlignmentError, HomeError};
use crate::models::series::{Grid, RawSample, TimeSeries};
use crate::power::PowerConverter;
use crate::sensor::Sensor;
use crate::source::RawSeriesSource;
use crate::store::{MissingRecord, PowerRecord, RawPowerRecord, RecordScope, SiteDayBatch};
use crate::utils::{format_window, local_day, round1};

/// Column-major table: one named column per sensor, one row per timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Table<T> {
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<String>,
    values: Vec<Vec<T>>,
}

impl<T: Copy> Table<T> {
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> Self {
        Table {
            timestamps,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<T>) {
        debug_assert_eq!(values.len(), self.timestamps.len());
        self.columns.push(name.into());
        self.values.push(values);
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&[T]> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(&self.values[index])
    }

    pub fn row(&self, index: usize) -> Vec<T> {
        self.values.iter().map(|column| column[index]).collect()
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Table<U> {
        Table {
            timestamps: self.timestamps.clone(),
            columns: self.columns.clone(),
            values: self
                .values
                .iter()
                .map(|column| column.iter().map(|v| f(*v)).collect())
                .collect(),
        }
    }

    /// Subset of rows for which `keep` holds, columns unchanged.
    pub fn filter_rows(&self, keep: impl Fn(&[T]) -> bool) -> Table<T> {
        let selected: Vec<usize> = (0..self.len()).filter(|&i| keep(&self.row(i))).collect();
        Table {
            timestamps: selected.iter().map(|&i| self.timestamps[i]).collect(),
            columns: self.columns.clone(),
            values: self
                .values
                .iter()
                .map(|column| selected.iter().map(|&i| column[i]).collect())
                .collect(),
        }
    }

    pub fn rename_columns(&mut self, f: impl Fn(&str) -> String) {
        for column in &mut self.columns {
            *column = f(column);
        }
    }

    /// Outer join on timestamp. Cells absent from both sides take `fill`;
    /// a column present on both sides takes `other`'s value where it has a row.
    pub fn join(&self, other: &Table<T>, fill: T) -> Table<T> {
        let stamps: BTreeSet<DateTime<Utc>> = self.timestamps.iter().chain(&other.timestamps).copied().collect();
        let timestamps: Vec<DateTime<Utc>> = stamps.into_iter().collect();

        let mut columns = self.columns.clone();
        for name in &other.columns {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }

        let mut values = vec![vec![fill; timestamps.len()]; columns.len()];
        for table in [self, other] {
            let positions: Vec<usize> = table
                .timestamps
                .iter()
                .map(|ts| timestamps.binary_search(ts).unwrap_or_else(|i| i))
                .collect();
            for (source, name) in table.columns.iter().enumerate() {
                let Some(target) = columns.iter().position(|c| c == name) else { continue };
                for (row, &pos) in positions.iter().enumerate() {
                    values[target][pos] = table.values[source][row];
                }
            }
        }

        Table {
            timestamps,
            columns,
            values,
        }
    }
}

impl Table<f64> {
    pub fn column_totals(&self) -> Vec<(String, f64)> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, column)| (name.clone(), round1(column.iter().sum())))
            .collect()
    }
}

impl Table<Option<f64>> {
    /// One column per series; timestamps are the union of all series.
    pub fn outer_join(series: Vec<(String, TimeSeries)>) -> Self {
        let stamps: BTreeSet<DateTime<Utc>> = series
            .iter()
            .flat_map(|(_, s)| s.samples().iter().map(|sample| sample.timestamp))
            .collect();
        let mut table = Table::new(stamps.into_iter().collect());
        for (name, s) in series {
            let mut column = vec![None; table.len()];
            for sample in s.samples() {
                if let Ok(pos) = table.timestamps.binary_search(&sample.timestamp) {
                    column[pos] = sample.value;
                }
            }
            table.push_column(name, column);
        }
        table
    }

    pub fn column_series(&self, index: usize) -> TimeSeries {
        TimeSeries::from_samples(
            self.timestamps
                .iter()
                .zip(&self.values[index])
                .filter_map(|(ts, v)| v.map(|v| RawSample::new(*ts, v)))
                .collect(),
        )
    }

    pub fn missing_cells(&self) -> usize {
        self.values.iter().flatten().filter(|v| v.is_none()).count()
    }
}

/// Consumption, production and total power on a shared set of timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsProdTable {
    timestamps: Vec<DateTime<Utc>>,
    p_cons: Vec<f64>,
    p_prod: Vec<f64>,
    p_tot: Vec<f64>,
}

/// Rows breaking the sign convention: consumption is drawn from the grid
/// (non-negative) and production is injected (non-positive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignViolations {
    pub negative_consumption: usize,
    pub positive_production: usize,
}

impl SignViolations {
    pub fn is_empty(&self) -> bool {
        self.negative_consumption == 0 && self.positive_production == 0
    }
}

impl ConsProdTable {
    /// Every column must hold one value per timestamp.
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        p_cons: Vec<f64>,
        p_prod: Vec<f64>,
        p_tot: Vec<f64>,
    ) -> Result<Self, AlignmentError> {
        for column in [&p_cons, &p_prod, &p_tot] {
            if column.len() != timestamps.len() {
                return Err(AlignmentError::LengthMismatch {
                    expected: timestamps.len(),
                    actual: column.len(),
                });
            }
        }
        Ok(ConsProdTable {
            timestamps,
            p_cons,
            p_prod,
            p_tot,
        })
    }

    fn push(&mut self, ts: DateTime<Utc>, cons: f64, prod: f64, tot: f64) {
        self.timestamps.push(ts);
        self.p_cons.push(round1(cons));
        self.p_prod.push(round1(prod));
        self.p_tot.push(round1(tot));
    }

    /// `P_prod = Σ pro·raw`, `P_tot = Σ net·raw`, `P_cons = P_tot − P_prod`.
    pub fn derive(raw: &Table<f64>, weights: &[(usize, Roles)]) -> Self {
        let mut table = ConsProdTable::default();
        for (i, ts) in raw.timestamps().iter().enumerate() {
            let mut prod = 0.0;
            let mut tot = 0.0;
            for &(column, roles) in weights {
                let value = raw.values[column][i];
                prod += f64::from(roles.pro) * value;
                tot += f64::from(roles.net) * value;
            }
            table.push(*ts, tot - prod, prod, tot);
        }
        table
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn p_cons(&self) -> &[f64] {
        &self.p_cons
    }

    pub fn p_prod(&self) -> &[f64] {
        &self.p_prod
    }

    pub fn p_tot(&self) -> &[f64] {
        &self.p_tot
    }

    /// Inverse of [`ConsProdTable::records`]; rows are expected in timestamp order.
    pub fn from_records(records: &[PowerRecord]) -> Self {
        let mut table = ConsProdTable::default();
        for r in records {
            table.push(r.timestamp, r.p_cons, r.p_prod, r.p_tot);
        }
        table
    }

    /// Every row as a persisted record of `site_id` on `day`.
    pub fn records(&self, site_id: &str, day: NaiveDate) -> Vec<PowerRecord> {
        self.iter()
            .map(|(timestamp, p_cons, p_prod, p_tot)| PowerRecord {
                site_id: site_id.to_string(),
                day,
                timestamp,
                p_cons,
                p_prod,
                p_tot,
            })
            .collect()
    }

    /// `(timestamp, p_cons, p_prod, p_tot)` per row.
    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, f64, f64, f64)> + '_ {
        self.timestamps
            .iter()
            .zip(&self.p_cons)
            .zip(&self.p_prod)
            .zip(&self.p_tot)
            .map(|(((ts, cons), prod), tot)| (*ts, *cons, *prod, *tot))
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Element-wise sum, missing indices on either side count as zero.
    pub fn add(&self, other: &ConsProdTable) -> ConsProdTable {
        let mut sums: BTreeMap<DateTime<Utc>, [f64; 3]> = BTreeMap::new();
        for (ts, cons, prod, tot) in self.iter().chain(other.iter()) {
            let entry = sums.entry(ts).or_insert([0.0; 3]);
            entry[0] += cons;
            entry[1] += prod;
            entry[2] += tot;
        }

        let mut out = ConsProdTable::default();
        for (ts, [cons, prod, tot]) in sums {
            out.push(ts, cons, prod, tot);
        }
        out
    }

    /// Rows where all three series are exactly zero.
    pub fn zero_rows(&self) -> usize {
        self.iter()
            .filter(|&(_, cons, prod, tot)| cons == 0.0 && prod == 0.0 && tot == 0.0)
            .count()
    }

    /// Rows with consumption below `-tolerance` or production above `tolerance` watts.
    pub fn sign_violations(&self, tolerance: f64) -> SignViolations {
        let mut violations = SignViolations::default();
        for (_, cons, prod, _) in self.iter() {
            if cons < -tolerance {
                violations.negative_consumption += 1;
            }
            if prod > tolerance {
                violations.positive_production += 1;
            }
        }
        violations
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityCounters {
    pub rows_total: usize,
    /// Rows with at least one missing cell.
    pub rows_with_gap: usize,
    /// Rows where every cell is missing.
    pub rows_all_missing: usize,
    pub cells_missing: usize,
}

impl QualityCounters {
    fn of(power: &Table<Option<f64>>) -> Self {
        let mut counters = QualityCounters {
            rows_total: power.len(),
            cells_missing: power.missing_cells(),
            ..Default::default()
        };
        for i in 0..power.len() {
            let row = power.row(i);
            let missing = row.iter().filter(|v| v.is_none()).count();
            if missing > 0 {
                counters.rows_with_gap += 1;
            }
            if missing == row.len() {
                counters.rows_all_missing += 1;
            }
        }
        counters
    }

    /// Share of rows with a gap, `0.0` for an empty window.
    pub fn gap_ratio(&self) -> f64 {
        if self.rows_total == 0 {
            return 0.0;
        }
        self.rows_with_gap as f64 / self.rows_total as f64
    }
}

/// One site materialized over one window.
#[derive(Debug, Clone)]
pub struct Home<'c> {
    site_id: String,
    rows: Vec<&'c ConfigRow>,
    sensors: Vec<Sensor>,
    grid: Grid,
    power: Table<Option<f64>>,
    incomplete: Table<Option<f64>>,
    raw: Table<f64>,
    cons_prod: ConsProdTable,
    quality: QualityCounters,
    unavailable: Vec<String>,
    qualified: bool,
}

impl<'c> Home<'c> {
    /// Fetch, convert and aggregate every sensor of `site_id` over `grid`.
    ///
    /// A sensor whose fetch fails contributes an all-missing column and is
    /// listed in [`Home::unavailable_sensors`].
    pub fn build<S: RawSeriesSource + ?Sized>(
        configuration: &'c Configuration,
        site_id: &str,
        grid: Grid,
        converter: &PowerConverter,
        source: &S,
    ) -> Result<Self, HomeError> {
        let rows = configuration.site_rows(site_id);
        if rows.is_empty() {
            return Err(HomeError::UnknownSite(site_id.to_string()));
        }
        converter.grid(grid.since(), grid.until())?.ensure_same_period(&grid)?;

        let sensors: Vec<Sensor> = rows.iter().map(|row| Sensor::from_row(row)).collect();
        let mut unavailable = Vec::new();
        let mut fetched = Vec::with_capacity(sensors.len());
        for sensor in &sensors {
            let series = match source.fetch(sensor, grid.since(), grid.until()) {
                Ok(series) => series,
                Err(e) => {
                    warn!(
                        "Home: {} sensor {} unavailable for {}: {}",
                        site_id,
                        sensor,
                        format_window(grid.since(), grid.until()),
                        e
                    );
                    unavailable.push(sensor.sensor_id.clone());
                    TimeSeries::new()
                }
            };
            debug!("Home: {} sensor {} -> {} samples", site_id, sensor, series.len());
            fetched.push((sensor.sensor_id.clone(), series));
        }

        let energy = Table::outer_join(fetched);
        let mut power = Table::new(grid.timestamps().collect());
        for (index, name) in energy.columns().iter().enumerate() {
            let converted = converter.to_power(&energy.column_series(index), &grid)?;
            power.push_column(name.clone(), converted.values().to_vec());
        }

        let incomplete = power.filter_rows(|row| row.iter().any(Option::is_none));
        let quality = QualityCounters::of(&power);
        let raw = power.map(|v| round1(v.unwrap_or(0.0)));
        let weights: Vec<(usize, Roles)> = rows.iter().enumerate().map(|(i, row)| (i, row.roles)).collect();
        let cons_prod = ConsProdTable::derive(&raw, &weights);

        Ok(Home {
            site_id: site_id.to_string(),
            rows,
            sensors,
            grid,
            power,
            incomplete,
            raw,
            cons_prod,
            quality,
            unavailable,
            qualified: false,
        })
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn rows(&self) -> &[&'c ConfigRow] {
        &self.rows
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.grid.since()
    }

    pub fn until(&self) -> DateTime<Utc> {
        self.grid.until()
    }

    /// Per-sensor power before missing cells were coerced.
    pub fn uncoerced_power(&self) -> &Table<Option<f64>> {
        &self.power
    }

    /// Rows holding at least one missing cell, captured before coercion.
    pub fn incomplete(&self) -> &Table<Option<f64>> {
        &self.incomplete
    }

    /// Per-sensor power, missing cells as zero, one decimal.
    pub fn raw_power(&self) -> &Table<f64> {
        &self.raw
    }

    pub fn cons_prod(&self) -> &ConsProdTable {
        &self.cons_prod
    }

    pub fn quality(&self) -> QualityCounters {
        self.quality
    }

    pub fn unavailable_sensors(&self) -> &[String] {
        &self.unavailable
    }

    fn column_name(&self, row: &ConfigRow) -> String {
        if self.qualified {
            format!("{}_{}", row.site_id, row.sensor_id)
        } else {
            row.sensor_id.clone()
        }
    }

    fn qualify(&mut self) {
        if self.qualified {
            return;
        }
        let prefix = self.site_id.clone();
        let rename = |c: &str| format!("{prefix}_{c}");
        self.power.rename_columns(rename);
        self.incomplete.rename_columns(rename);
        self.raw.rename_columns(rename);
        self.qualified = true;
    }

    pub fn rename(&mut self, site_id: impl Into<String>) {
        self.qualify();
        self.site_id = site_id.into();
    }

    /// Join `other`'s columns in with site-qualified names and sum the
    /// consumption/production tables.
    pub fn merge(&mut self, other: &Home<'c>) -> Result<(), HomeError> {
        self.grid.ensure_aligned(&other.grid)?;

        let mut theirs = other.clone();
        theirs.qualify();
        self.qualify();

        self.power = self.power.join(&theirs.power, None);
        self.raw = self.raw.join(&theirs.raw, 0.0);
        self.incomplete = self.power.filter_rows(|row| row.iter().any(Option::is_none));
        self.quality = QualityCounters::of(&self.power);
        self.cons_prod = self.cons_prod.add(&theirs.cons_prod);

        for row in theirs.rows {
            if !self
                .rows
                .iter()
                .any(|r| r.site_id == row.site_id && r.sensor_id == row.sensor_id)
            {
                self.rows.push(row);
            }
        }
        for sensor in theirs.sensors {
            if !self.sensors.contains(&sensor) {
                self.sensors.push(sensor);
            }
        }
        for sensor_id in theirs.unavailable {
            if !self.unavailable.contains(&sensor_id) {
                self.unavailable.push(sensor_id);
            }
        }

        self.grid = Grid::new(
            self.grid.since().min(other.grid.since()),
            self.grid.until().max(other.grid.until()),
            self.grid.period(),
        )?;
        Ok(())
    }

    /// Raw power summed per device, columns named `site:device`.
    pub fn device_power(&self) -> Table<f64> {
        let mut by_device: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in &self.rows {
            let Some(column) = self.raw.column(&self.column_name(row)) else { continue };
            let sums = by_device
                .entry(format!("{}:{}", row.site_id, row.device_id))
                .or_insert_with(|| vec![0.0; column.len()]);
            for (sum, value) in sums.iter_mut().zip(column) {
                *sum += value;
            }
        }

        let mut table = Table::new(self.raw.timestamps().to_vec());
        for (name, sums) in by_device {
            table.push_column(name, sums.into_iter().map(round1).collect());
        }
        table
    }

    /// First missing tick per column, before coercion.
    pub fn first_missing(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.power
            .columns()
            .iter()
            .zip(&self.power.values)
            .map(|(name, column)| {
                let first = column
                    .iter()
                    .position(Option::is_none)
                    .map(|i| self.power.timestamps[i]);
                (name.clone(), first)
            })
            .collect()
    }

    /// Split the materialized rows into one batch per local civil day.
    /// Per-sensor and missing-tick rows are only emitted for [`RecordScope::Site`].
    pub fn to_batches(&self, tz: Tz, scope: RecordScope, config_id: DateTime<Utc>) -> Vec<SiteDayBatch> {
        let empty = |day: NaiveDate| empty_batch(scope, &self.site_id, day, config_id);
        let mut by_day: BTreeMap<NaiveDate, SiteDayBatch> = BTreeMap::new();

        for (ts, p_cons, p_prod, p_tot) in self.cons_prod.iter() {
            let day = local_day(ts, tz);
            by_day.entry(day).or_insert_with(|| empty(day)).power.push(PowerRecord {
                site_id: self.site_id.clone(),
                day,
                timestamp: ts,
                p_cons,
                p_prod,
                p_tot,
            });
        }

        if scope == RecordScope::Site {
            for (name, column) in self.raw.columns.iter().zip(&self.raw.values) {
                for (ts, power) in self.raw.timestamps.iter().zip(column) {
                    let day = local_day(*ts, tz);
                    by_day.entry(day).or_insert_with(|| empty(day)).raw.push(RawPowerRecord {
                        site_id: self.site_id.clone(),
                        sensor_id: name.clone(),
                        day,
                        timestamp: *ts,
                        power: *power,
                    });
                }
            }

            for (name, column) in self.power.columns.iter().zip(&self.power.values) {
                let mut gaps: BTreeMap<NaiveDate, (DateTime<Utc>, i32)> = BTreeMap::new();
                for (ts, value) in self.power.timestamps.iter().zip(column) {
                    if value.is_none() {
                        gaps.entry(local_day(*ts, tz)).or_insert((*ts, 0)).1 += 1;
                    }
                }
                for (day, (first_missing, missing_ticks)) in gaps {
                    by_day.entry(day).or_insert_with(|| empty(day)).missing.push(MissingRecord {
                        site_id: self.site_id.clone(),
                        sensor_id: name.clone(),
                        day,
                        first_missing,
                        missing_ticks,
                    });
                }
            }
        }

        by_day.into_values().collect()
    }

    /// The batch for `day`, empty when no tick of this home falls on it.
    pub fn day_batch(&self, day: NaiveDate, tz: Tz, scope: RecordScope, config_id: DateTime<Utc>) -> SiteDayBatch {
        self.to_batches(tz, scope, config_id)
            .into_iter()
            .find(|b| b.day == day)
            .unwrap_or_else(|| empty_batch(scope, &self.site_id, day, config_id))
    }
}

pub(crate) fn empty_batch(scope: RecordScope, site_id: &str, day: NaiveDate, config_id: DateTime<Utc>) -> SiteDayBatch {
    SiteDayBatch {
        scope,
        site_id: site_id.to_string(),
        day,
        config_id,
        power: Vec::new(),
        raw: Vec::new(),
        missing: Vec::new(),
    }
}

/// Rebuild one stored site-day under `configuration`'s coefficients.
///
/// `raw` is the persisted per-sensor power of that day. Sensors the
/// configuration lists without stored power read as zero and are recorded
/// as missing for the whole day; stored sensors it no longer lists are dropped.
pub fn rederive_site_day(
    configuration: &Configuration,
    site_id: &str,
    day: NaiveDate,
    raw: &[RawPowerRecord],
    missing: &[MissingRecord],
) -> Result<SiteDayBatch, HomeError> {
    let rows = configuration.site_rows(site_id);
    if rows.is_empty() {
        return Err(HomeError::UnknownSite(site_id.to_string()));
    }

    let stamps: BTreeSet<DateTime<Utc>> = raw.iter().map(|r| r.timestamp).collect();
    let mut table = Table::new(stamps.into_iter().collect());
    let mut weights = Vec::with_capacity(rows.len());
    let mut absent = Vec::new();
    for row in &rows {
        let mut column = vec![0.0; table.len()];
        let mut found = false;
        for record in raw.iter().filter(|r| r.sensor_id == row.sensor_id) {
            if let Ok(pos) = table.timestamps.binary_search(&record.timestamp) {
                column[pos] = record.power;
                found = true;
            }
        }
        if !found {
            absent.push(row.sensor_id.clone());
        }
        weights.push((table.width(), row.roles));
        table.push_column(row.sensor_id.clone(), column);
    }
    let cons_prod = ConsProdTable::derive(&table, &weights);

    let mut batch = empty_batch(RecordScope::Site, site_id, day, configuration.config_id());
    batch.power = cons_prod.records(site_id, day);
    for (name, column) in table.columns.iter().zip(&table.values) {
        batch.raw.extend(table.timestamps.iter().zip(column).map(|(ts, power)| RawPowerRecord {
            site_id: site_id.to_string(),
            sensor_id: name.clone(),
            day,
            timestamp: *ts,
            power: *power,
        }));
    }
    batch.missing = missing
        .iter()
        .filter(|m| table.columns.contains(&m.sensor_id) && !absent.contains(&m.sensor_id))
        .cloned()
        .collect();
    if let Some(first) = table.timestamps.first() {
        for sensor_id in absent {
            warn!("Home: {} day {} has no stored power for sensor {}", site_id, day, sensor_id);
            batch.missing.push(MissingRecord {
                site_id: site_id.to_string(),
                sensor_id,
                day,
                first_missing: *first,
                missing_ticks: i32::try_from(table.len()).unwrap_or(i32::MAX),
            });
        }
    }
    Ok(batch)
}
