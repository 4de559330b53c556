//! Day-by-day materialization of every configured site into the power store.
//!
//! - Days run in chronological order; the sites of one day run in parallel on a
//!   bounded worker pool.
//! - Each `(site, day)` is persisted as one batch, retried as a unit.
//! - A site's marker only advances over an unbroken run of successful days.
//! - Recent days that were stored with missing ticks are planned again.

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::thread;

use crate::configuration::{Configuration, SiteGroup};
use crate::error::{HomeError, SiteDayError, SyncError};
use crate::home::{ConsProdTable, Home, QualityCounters, empty_batch, rederive_site_day};
use crate::power::PowerConverter;
use crate::source::{RawSeriesSource, RetryPolicy};
use crate::store::{PowerStore, RecordScope, SiteDayBatch, StoreError};
use crate::utils::{day_window, days_between, format_window, local_day};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Civil calendar used to cut days.
    pub timezone: Tz,
    pub workers: NonZeroUsize,
    /// Attempts and delay for one site-day batch write.
    pub persist: RetryPolicy,
    /// Flag site-days whose share of gap rows reaches this ratio.
    pub missing_alert_ratio: Option<f64>,
    /// Flag site-days with consumption below `-tolerance` or production above
    /// `tolerance` watts.
    pub sign_alert_tolerance: Option<f64>,
    /// Days before the plan start that are synced again while they hold
    /// missing ticks. 0 disables it.
    pub gap_retry_days: u32,
    pub from_day: Option<NaiveDate>,
    pub until_day: Option<NaiveDate>,
}

/// Days to sync per site, plus each site's marker when the plan was made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub days: BTreeMap<String, Vec<NaiveDate>>,
    pub markers: BTreeMap<String, Option<NaiveDate>>,
    /// Already synced days planned again because they hold missing ticks.
    pub retried: BTreeMap<String, Vec<NaiveDate>>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.days.values().all(Vec::is_empty)
    }

    fn all_days(&self) -> BTreeSet<NaiveDate> {
        self.days.values().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteSummary {
    pub days_synced: usize,
    pub days_failed: Vec<NaiveDate>,
    pub rows: usize,
    pub cells_missing: usize,
    pub rows_with_gap: usize,
    pub unavailable_sensors: BTreeSet<String>,
    pub flagged_days: Vec<NaiveDate>,
    pub sign_flagged_days: Vec<NaiveDate>,
    pub last_synced: Option<NaiveDate>,
}

impl SiteSummary {
    fn record(&mut self, outcome: &SiteDayOutcome) {
        self.days_synced += 1;
        self.rows += outcome.rows;
        self.cells_missing += outcome.quality.cells_missing;
        self.rows_with_gap += outcome.quality.rows_with_gap;
        self.unavailable_sensors.extend(outcome.unavailable.iter().cloned());
        if outcome.flagged {
            self.flagged_days.push(outcome.day);
        }
        if outcome.sign_flagged {
            self.sign_flagged_days.push(outcome.day);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub sites: BTreeMap<String, SiteSummary>,
    pub groups: BTreeMap<String, SiteSummary>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.sites.values().chain(self.groups.values()).any(|s| !s.days_failed.is_empty())
    }

    pub fn log(&self) {
        for (kind, summaries) in [("site", &self.sites), ("group", &self.groups)] {
            for (id, s) in summaries {
                info!(
                    "Sync: {} {} synced {} day(s), {} row(s), {} missing cell(s), {} incomplete row(s), marker {}",
                    kind,
                    id,
                    s.days_synced,
                    s.rows,
                    s.cells_missing,
                    s.rows_with_gap,
                    s.last_synced.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
                );
                if !s.unavailable_sensors.is_empty() {
                    let sensors: Vec<&str> = s.unavailable_sensors.iter().map(String::as_str).collect();
                    warn!("Sync: {} {} had unavailable sensors: {}", kind, id, sensors.join(", "));
                }
                if !s.days_failed.is_empty() {
                    warn!("Sync: {} {} failed on {} day(s): {:?}", kind, id, s.days_failed.len(), s.days_failed);
                }
                if !s.flagged_days.is_empty() {
                    warn!("Sync: {} {} flagged for missing data on {:?}", kind, id, s.flagged_days);
                }
                if !s.sign_flagged_days.is_empty() {
                    warn!("Sync: {} {} flagged for power signs on {:?}", kind, id, s.sign_flagged_days);
                }
            }
        }
    }
}

struct SiteDayOutcome<'c> {
    day: NaiveDate,
    home: Home<'c>,
    rows: usize,
    quality: QualityCounters,
    unavailable: Vec<String>,
    flagged: bool,
    sign_flagged: bool,
}

pub struct SyncOrchestrator<'a> {
    source: &'a dyn RawSeriesSource,
    store: &'a dyn PowerStore,
    converter: PowerConverter,
    settings: SyncSettings,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        source: &'a dyn RawSeriesSource,
        store: &'a dyn PowerStore,
        converter: PowerConverter,
        settings: SyncSettings,
    ) -> Self {
        SyncOrchestrator {
            source,
            store,
            converter,
            settings,
        }
    }

    /// Days to sync per site of `configuration`, up to (excluding) `today`.
    ///
    /// Start: `from_day` if set, else the day after the site's marker, else the
    /// local day the site first appeared in any configuration version. Without
    /// `from_day`, stored days with missing ticks in the last `gap_retry_days`
    /// before `today` are planned again.
    pub fn plan(
        &self,
        configuration: &Configuration,
        first_seen: &BTreeMap<String, DateTime<Utc>>,
        today: NaiveDate,
    ) -> Result<SyncPlan, SyncError> {
        let tz = self.settings.timezone;
        let until = self.settings.until_day.unwrap_or(today);
        let mut plan = SyncPlan::default();

        for site_id in configuration.site_ids() {
            let marker = self.store.last_synced_day(site_id)?;
            let start = match (self.settings.from_day, marker) {
                (Some(from), _) => from,
                (None, Some(last)) => last.succ_opt().unwrap_or(last),
                (None, None) => first_seen
                    .get(site_id)
                    .map(|t| local_day(*t, tz))
                    .unwrap_or_else(|| local_day(configuration.config_id(), tz)),
            };
            let mut days = days_between(start, until);

            let retried = self.retry_days(site_id, start.min(until), until)?;
            if !retried.is_empty() {
                info!("Sync: site {} retries {} day(s) with missing ticks: {:?}", site_id, retried.len(), retried);
                days.extend(retried.iter().copied());
                days.sort_unstable();
                days.dedup();
                plan.retried.insert(site_id.to_string(), retried);
            }

            debug!(
                "Sync: site {} plan {} day(s) from {} (marker {:?})",
                site_id,
                days.len(),
                start,
                marker
            );
            plan.days.insert(site_id.to_string(), days);
            plan.markers.insert(site_id.to_string(), marker);
        }
        Ok(plan)
    }

    /// Gap days in `[until - gap_retry_days, start)`.
    fn retry_days(&self, site_id: &str, start: NaiveDate, until: NaiveDate) -> Result<Vec<NaiveDate>, SyncError> {
        if self.settings.from_day.is_some() || self.settings.gap_retry_days == 0 {
            return Ok(Vec::new());
        }
        let Some(from) = until.checked_sub_days(Days::new(u64::from(self.settings.gap_retry_days))) else {
            return Ok(Vec::new());
        };
        if from >= start {
            return Ok(Vec::new());
        }
        Ok(self.store.gap_days(site_id, from, start)?)
    }

    /// Build a home over an arbitrary window without persisting it.
    pub fn materialize<'c>(
        &self,
        configuration: &'c Configuration,
        site_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Home<'c>, HomeError> {
        let grid = self.converter.grid(since, until)?;
        Home::build(configuration, site_id, grid, &self.converter, self.source)
    }

    fn pool(&self) -> Result<rayon::ThreadPool, SyncError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.get())
            .build()
            .map_err(|e| SyncError::WorkerPool(e.to_string()))
    }

    /// Execute `plan` against one resolved configuration.
    pub fn run(
        &self,
        configuration: &Configuration,
        groups: &[SiteGroup],
        plan: &SyncPlan,
    ) -> Result<SyncReport, SyncError> {
        let pool = self.pool()?;

        let mut report = SyncReport::default();
        let mut markers = plan.markers.clone();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        for site_id in plan.days.keys() {
            report.sites.insert(
                site_id.clone(),
                SiteSummary {
                    last_synced: markers.get(site_id).copied().flatten(),
                    ..Default::default()
                },
            );
        }

        let days = plan.all_days();
        info!(
            "Sync: {} site(s), {} day(s) with config {}",
            plan.days.len(),
            days.len(),
            configuration.config_id().to_rfc3339()
        );

        for day in days {
            let sites: Vec<&String> = plan
                .days
                .iter()
                .filter(|(_, d)| d.contains(&day))
                .map(|(site, _)| site)
                .collect();

            let outcomes: Vec<(&String, Result<SiteDayOutcome, SiteDayError>)> = pool.install(|| {
                sites
                    .par_iter()
                    .map(|site| (*site, self.sync_site_day(configuration, site, day)))
                    .collect()
            });

            let mut homes: BTreeMap<&str, &Home> = BTreeMap::new();
            let mut failed: BTreeSet<&str> = BTreeSet::new();
            for (site_id, outcome) in &outcomes {
                let summary = report.sites.entry(site_id.to_string()).or_default();
                let marker = markers.entry(site_id.to_string()).or_default();
                match outcome {
                    Ok(done) => {
                        summary.record(done);
                        homes.insert(site_id.as_str(), &done.home);
                        if blocked.contains(site_id.as_str()) {
                            continue;
                        }
                        if marker.is_none_or(|m| day > m) {
                            match self.store.set_last_synced_day(site_id, day) {
                                Ok(()) => {
                                    *marker = Some(day);
                                    summary.last_synced = Some(day);
                                }
                                Err(e) => {
                                    warn!("Sync: could not advance marker of {} to {}: {}", site_id, day, e);
                                    blocked.insert(site_id.to_string());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Sync: site {} day {} failed: {}", site_id, day, e);
                        summary.days_failed.push(day);
                        failed.insert(site_id.as_str());
                        // A failed retry of an already covered day leaves the marker alone.
                        if marker.is_none_or(|m| day > m) {
                            blocked.insert(site_id.to_string());
                        }
                    }
                }
            }

            for group in groups {
                self.sync_group_day(configuration, group, day, &homes, &failed, &mut report);
            }
        }

        Ok(report)
    }

    fn sync_site_day<'c>(
        &self,
        configuration: &'c Configuration,
        site_id: &str,
        day: NaiveDate,
    ) -> Result<SiteDayOutcome<'c>, SiteDayError> {
        let tz = self.settings.timezone;
        let (since, until) = day_window(day, tz);
        debug!("Sync: site {} day {} window {}", site_id, day, format_window(since, until));

        let home = self.materialize(configuration, site_id, since, until)?;
        for (column, first) in home.first_missing() {
            if let Some(ts) = first {
                debug!("Sync: site {} sensor {} first missing tick {}", site_id, column, ts.to_rfc3339());
            }
        }

        let batch = home.day_batch(day, tz, RecordScope::Site, configuration.config_id());
        let rows = self.persist(&batch)?;
        let quality = home.quality();
        let flagged = self.is_flagged(&home);
        let sign_flagged = self.is_sign_flagged(site_id, day, home.cons_prod());
        Ok(SiteDayOutcome {
            day,
            rows,
            quality,
            unavailable: home.unavailable_sensors().to_vec(),
            flagged,
            sign_flagged,
            home,
        })
    }

    /// Merge the day's homes of every member and persist them under the group id.
    ///
    /// Runs when at least one member was planned on `day`. Members that were not
    /// planned are materialized for the day without being persisted. Skipped
    /// when any member failed that day.
    fn sync_group_day<'c>(
        &self,
        configuration: &'c Configuration,
        group: &SiteGroup,
        day: NaiveDate,
        homes: &BTreeMap<&str, &Home<'c>>,
        failed: &BTreeSet<&str>,
        report: &mut SyncReport,
    ) {
        let members: Vec<&str> = group
            .site_ids
            .iter()
            .map(String::as_str)
            .filter(|s| configuration.site_ids().contains(s))
            .collect();
        if !members.iter().any(|m| homes.contains_key(m) || failed.contains(m)) {
            return;
        }
        let summary = report.groups.entry(group.group_id.clone()).or_default();
        let broken: Vec<&str> = members.iter().copied().filter(|m| failed.contains(m)).collect();
        if !broken.is_empty() {
            warn!(
                "Sync: group {} day {} skipped, member(s) failed: {}",
                group.group_id,
                day,
                broken.join(", ")
            );
            summary.days_failed.push(day);
            return;
        }

        let (since, until) = day_window(day, self.settings.timezone);
        let mut rebuilt: Vec<Home<'c>> = Vec::new();
        for member in &members {
            if homes.contains_key(member) {
                continue;
            }
            match self.materialize(configuration, member, since, until) {
                Ok(home) => {
                    debug!("Sync: group {} day {} rebuilt member {}", group.group_id, day, member);
                    rebuilt.push(home);
                }
                Err(e) => {
                    warn!("Sync: group {} day {} member {} failed: {}", group.group_id, day, member, e);
                    summary.days_failed.push(day);
                    return;
                }
            }
        }
        let parts: Vec<&Home<'c>> = members
            .iter()
            .filter_map(|m| homes.get(m).copied().or_else(|| rebuilt.iter().find(|h| h.site_id() == *m)))
            .collect();

        let mut merged = parts[0].clone();
        for home in &parts[1..] {
            if let Err(e) = merged.merge(home) {
                warn!("Sync: group {} day {} merge failed: {}", group.group_id, day, e);
                summary.days_failed.push(day);
                return;
            }
        }
        merged.rename(group.group_id.clone());

        let batch = merged.day_batch(day, self.settings.timezone, RecordScope::Group, configuration.config_id());
        match self.persist(&batch) {
            Ok(rows) => {
                let flagged = self.is_flagged(&merged);
                let sign_flagged = self.is_sign_flagged(&group.group_id, day, merged.cons_prod());
                summary.record(&SiteDayOutcome {
                    day,
                    rows,
                    quality: merged.quality(),
                    unavailable: merged.unavailable_sensors().to_vec(),
                    flagged,
                    sign_flagged,
                    home: merged,
                });
                summary.last_synced = Some(day);
            }
            Err(e) => {
                warn!("Sync: group {} day {} failed: {}", group.group_id, day, e);
                summary.days_failed.push(day);
            }
        }
    }

    /// Re-derive every stored site-day from its persisted per-sensor power
    /// under `configuration`, then rebuild the affected group days.
    ///
    /// Nothing is fetched and markers are left alone. `from_day` and
    /// `until_day` narrow the days when set.
    pub fn recompute(&self, configuration: &Configuration, groups: &[SiteGroup]) -> Result<SyncReport, SyncError> {
        let pool = self.pool()?;
        info!(
            "Recompute: {} site(s) with config {}",
            configuration.site_ids().len(),
            configuration.config_id().to_rfc3339()
        );

        let sites = configuration.site_ids();
        let results: Vec<(&str, Result<(SiteSummary, Vec<NaiveDate>), SyncError>)> = pool.install(|| {
            sites
                .par_iter()
                .map(|site| (*site, self.recompute_site(configuration, site)))
                .collect()
        });

        let mut report = SyncReport::default();
        let mut done: BTreeMap<&str, Vec<NaiveDate>> = BTreeMap::new();
        for (site_id, result) in results {
            let (summary, days) = result?;
            report.sites.insert(site_id.to_string(), summary);
            done.insert(site_id, days);
        }

        for group in groups {
            let members: Vec<&str> = group
                .site_ids
                .iter()
                .map(String::as_str)
                .filter(|s| sites.contains(s))
                .collect();
            let days: BTreeSet<NaiveDate> = members
                .iter()
                .filter_map(|m| done.get(m))
                .flatten()
                .copied()
                .chain(members.iter().flat_map(|m| report.sites[*m].days_failed.iter().copied()))
                .collect();
            let mut summary = SiteSummary::default();
            for day in days {
                let broken: Vec<&str> = members
                    .iter()
                    .copied()
                    .filter(|m| report.sites[*m].days_failed.contains(&day))
                    .collect();
                if !broken.is_empty() {
                    warn!("Recompute: group {} day {} skipped, member(s) failed: {}", group.group_id, day, broken.join(", "));
                    summary.days_failed.push(day);
                    continue;
                }
                match self.recompute_group_day(configuration, group, &members, day) {
                    Ok((rows, sign_flagged)) => {
                        summary.days_synced += 1;
                        summary.rows += rows;
                        summary.last_synced = Some(day);
                        if sign_flagged {
                            summary.sign_flagged_days.push(day);
                        }
                    }
                    Err(e) => {
                        warn!("Recompute: group {} day {} failed: {}", group.group_id, day, e);
                        summary.days_failed.push(day);
                    }
                }
            }
            report.groups.insert(group.group_id.clone(), summary);
        }

        Ok(report)
    }

    /// Returns the summary and the days rewritten.
    fn recompute_site(
        &self,
        configuration: &Configuration,
        site_id: &str,
    ) -> Result<(SiteSummary, Vec<NaiveDate>), SyncError> {
        let mut summary = SiteSummary {
            last_synced: self.store.last_synced_day(site_id)?,
            ..Default::default()
        };
        let days: Vec<NaiveDate> = self
            .store
            .raw_days(site_id)?
            .into_iter()
            .filter(|d| self.settings.from_day.is_none_or(|from| *d >= from))
            .filter(|d| self.settings.until_day.is_none_or(|until| *d < until))
            .collect();
        debug!("Recompute: site {} has {} stored day(s)", site_id, days.len());

        let mut rewritten = Vec::with_capacity(days.len());
        for day in days {
            match self.recompute_site_day(configuration, site_id, day) {
                Ok(batch) => {
                    summary.days_synced += 1;
                    summary.rows += batch.len();
                    summary.cells_missing += batch
                        .missing
                        .iter()
                        .map(|m| usize::try_from(m.missing_ticks).unwrap_or(0))
                        .sum::<usize>();
                    if self.is_sign_flagged(site_id, day, &ConsProdTable::from_records(&batch.power)) {
                        summary.sign_flagged_days.push(day);
                    }
                    rewritten.push(day);
                }
                Err(e) => {
                    warn!("Recompute: site {} day {} failed: {}", site_id, day, e);
                    summary.days_failed.push(day);
                }
            }
        }
        Ok((summary, rewritten))
    }

    fn recompute_site_day(
        &self,
        configuration: &Configuration,
        site_id: &str,
        day: NaiveDate,
    ) -> Result<SiteDayBatch, SiteDayError> {
        let load_error = |source: StoreError| SiteDayError::Load {
            site_id: site_id.to_string(),
            day,
            source,
        };
        let raw = self.store.load_raw_day(site_id, day).map_err(load_error)?;
        let missing = self.store.load_missing_day(site_id, day).map_err(load_error)?;
        let batch = rederive_site_day(configuration, site_id, day, &raw, &missing)?;
        self.persist(&batch)?;
        Ok(batch)
    }

    /// Sum the stored site rows of every member on `day`. Returns the rows
    /// written and whether the sign check flagged the day.
    fn recompute_group_day(
        &self,
        configuration: &Configuration,
        group: &SiteGroup,
        members: &[&str],
        day: NaiveDate,
    ) -> Result<(usize, bool), SiteDayError> {
        let mut total = ConsProdTable::default();
        for member in members {
            let records = self
                .store
                .load_site_day(RecordScope::Site, member, day)
                .map_err(|source| SiteDayError::Load {
                    site_id: member.to_string(),
                    day,
                    source,
                })?;
            total = total.add(&ConsProdTable::from_records(&records));
        }
        let mut batch = empty_batch(RecordScope::Group, &group.group_id, day, configuration.config_id());
        batch.power = total.records(&group.group_id, day);
        let rows = self.persist(&batch)?;
        Ok((rows, self.is_sign_flagged(&group.group_id, day, &total)))
    }

    fn is_flagged(&self, home: &Home) -> bool {
        let Some(ratio) = self.settings.missing_alert_ratio else {
            return false;
        };
        let quality = home.quality();
        let flagged = quality.rows_total > 0 && quality.gap_ratio() >= ratio;
        if flagged {
            warn!(
                "Sync: {} {} has {:.1}% incomplete rows, {} all-zero rows",
                home.site_id(),
                format_window(home.since(), home.until()),
                quality.gap_ratio() * 100.0,
                home.cons_prod().zero_rows()
            );
        }
        flagged
    }

    fn is_sign_flagged(&self, site_id: &str, day: NaiveDate, cons_prod: &ConsProdTable) -> bool {
        let Some(tolerance) = self.settings.sign_alert_tolerance else {
            return false;
        };
        let violations = cons_prod.sign_violations(tolerance);
        if !violations.is_empty() {
            warn!(
                "Sync: {} {} has {} row(s) with consumption below -{} W and {} row(s) with production above {} W",
                site_id, day, violations.negative_consumption, tolerance, violations.positive_production, tolerance
            );
        }
        !violations.is_empty()
    }

    fn persist(&self, batch: &SiteDayBatch) -> Result<usize, SiteDayError> {
        let attempts = self.settings.persist.attempts.get();
        let mut attempt = 1;
        loop {
            match self.store.replace_site_day(batch) {
                Ok(rows) => return Ok(rows),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Sync: writing {} {} failed (attempt {}/{}): {}",
                        batch.site_id, batch.day, attempt, attempts, e
                    );
                    attempt += 1;
                    if !self.settings.persist.delay.is_zero() {
                        thread::sleep(self.settings.persist.delay);
                    }
                }
                Err(last) => {
                    return Err(SiteDayError::Persist {
                        site_id: batch.site_id.clone(),
                        day: batch.day,
                        attempts: attempt,
                        last,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::tests::row;
    use crate::home::tests::{StaticSource, ramp};
    use crate::power::DEFAULT_UNIT_SCALE;
    use crate::store::{MissingRecord, PowerRecord, RawPowerRecord};
    use chrono::{TimeDelta, TimeZone};
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU32;
    use std::sync::Mutex;
    use std::time::Duration;

    type Key = (RecordScope, String, NaiveDate);

    #[derive(Default)]
    struct MemoryStore {
        power: Mutex<BTreeMap<Key, Vec<PowerRecord>>>,
        raw: Mutex<BTreeMap<(String, NaiveDate), Vec<RawPowerRecord>>>,
        missing: Mutex<BTreeMap<(String, NaiveDate), Vec<MissingRecord>>>,
        markers: Mutex<BTreeMap<String, NaiveDate>>,
        failing: Mutex<BTreeSet<(String, NaiveDate)>>,
        writes: Mutex<usize>,
    }

    impl MemoryStore {
        fn fail_on(&self, site_id: &str, day: NaiveDate) {
            self.failing.lock().unwrap().insert((site_id.to_string(), day));
        }

        fn with_gap(&self, site_id: &str, sensor_id: &str, day: NaiveDate) {
            self.missing.lock().unwrap().insert(
                (site_id.to_string(), day),
                vec![MissingRecord {
                    site_id: site_id.to_string(),
                    sensor_id: sensor_id.to_string(),
                    day,
                    first_missing: Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap()),
                    missing_ticks: 1,
                }],
            );
        }

        fn marker(&self, site_id: &str) -> Option<NaiveDate> {
            self.markers.lock().unwrap().get(site_id).copied()
        }

        fn rows(&self, scope: RecordScope, site_id: &str, day: NaiveDate) -> Vec<PowerRecord> {
            self.load_site_day(scope, site_id, day).unwrap()
        }
    }

    impl PowerStore for MemoryStore {
        fn replace_site_day(&self, batch: &SiteDayBatch) -> Result<usize, StoreError> {
            *self.writes.lock().unwrap() += 1;
            if self.failing.lock().unwrap().contains(&(batch.site_id.clone(), batch.day)) {
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.power
                .lock()
                .unwrap()
                .insert((batch.scope, batch.site_id.clone(), batch.day), batch.power.clone());
            if batch.scope == RecordScope::Site {
                let key = (batch.site_id.clone(), batch.day);
                self.raw.lock().unwrap().insert(key.clone(), batch.raw.clone());
                self.missing.lock().unwrap().insert(key, batch.missing.clone());
            }
            Ok(batch.power.len())
        }

        fn load_site_day(&self, scope: RecordScope, site_id: &str, day: NaiveDate) -> Result<Vec<PowerRecord>, StoreError> {
            Ok(self
                .power
                .lock()
                .unwrap()
                .get(&(scope, site_id.to_string(), day))
                .cloned()
                .unwrap_or_default())
        }

        fn last_synced_day(&self, site_id: &str) -> Result<Option<NaiveDate>, StoreError> {
            Ok(self.marker(site_id))
        }

        fn set_last_synced_day(&self, site_id: &str, day: NaiveDate) -> Result<(), StoreError> {
            self.markers.lock().unwrap().insert(site_id.to_string(), day);
            Ok(())
        }

        fn gap_days(&self, site_id: &str, from: NaiveDate, until: NaiveDate) -> Result<Vec<NaiveDate>, StoreError> {
            Ok(self
                .missing
                .lock()
                .unwrap()
                .iter()
                .filter(|((site, day), gaps)| site == site_id && *day >= from && *day < until && !gaps.is_empty())
                .map(|((_, day), _)| *day)
                .collect())
        }

        fn raw_days(&self, site_id: &str) -> Result<Vec<NaiveDate>, StoreError> {
            Ok(self
                .raw
                .lock()
                .unwrap()
                .iter()
                .filter(|((site, _), rows)| site == site_id && !rows.is_empty())
                .map(|((_, day), _)| *day)
                .collect())
        }

        fn load_raw_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<RawPowerRecord>, StoreError> {
            Ok(self
                .raw
                .lock()
                .unwrap()
                .get(&(site_id.to_string(), day))
                .cloned()
                .unwrap_or_default())
        }

        fn load_missing_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<MissingRecord>, StoreError> {
            Ok(self
                .missing
                .lock()
                .unwrap()
                .get(&(site_id.to_string(), day))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn settings(from: Option<NaiveDate>, until: Option<NaiveDate>) -> SyncSettings {
        SyncSettings {
            timezone: chrono_tz::UTC,
            workers: NonZeroUsize::new(2).unwrap(),
            persist: RetryPolicy::new(NonZeroU32::new(2).unwrap(), Duration::ZERO),
            missing_alert_ratio: None,
            sign_alert_tolerance: None,
            gap_retry_days: 2,
            from_day: from,
            until_day: until,
        }
    }

    fn converter() -> PowerConverter {
        PowerConverter::new(TimeDelta::seconds(8), DEFAULT_UNIT_SCALE).unwrap()
    }

    fn config() -> Configuration {
        let created = Utc.with_ymd_and_hms(2023, 1, 1, 6, 0, 0).unwrap();
        Configuration::new(created, vec![row("H1", "A", 1, 0), row("H1", "B", 1, 1), row("H2", "C", 1, 0)]).unwrap()
    }

    /// Three days of 8-second counters for every sensor.
    fn source() -> StaticSource {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let ticks = 3 * 10_800;
        StaticSource::default()
            .with("A", ramp(start, ticks, 0.1))
            .with("B", ramp(start, ticks, 0.03))
            .with("C", ramp(start, ticks, 0.05))
    }

    #[test]
    fn plan_defaults_to_first_seen_and_resumes_after_marker() {
        let store = MemoryStore::default();
        store.set_last_synced_day("H2", date(5)).unwrap();
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(None, None));

        let first_seen = BTreeMap::from([("H1".to_string(), Utc.with_ymd_and_hms(2023, 1, 2, 9, 0, 0).unwrap())]);
        let plan = orchestrator.plan(&config(), &first_seen, date(8)).unwrap();
        assert_eq!(plan.days["H1"], days_between(date(2), date(8)));
        assert_eq!(plan.days["H2"], vec![date(6), date(7)]);
        assert_eq!(plan.markers["H2"], Some(date(5)));

        let manual = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(3)), Some(date(4))));
        let plan = manual.plan(&config(), &first_seen, date(8)).unwrap();
        assert_eq!(plan.days["H2"], vec![date(3)]);
    }

    #[test]
    fn resync_overwrites_instead_of_appending() {
        let store = MemoryStore::default();
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(1)), Some(date(2))));
        let config = config();

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let first = orchestrator.run(&config, &[], &plan).unwrap();
        let rows_after_first = store.rows(RecordScope::Site, "H1", date(1));
        let second = orchestrator.run(&config, &[], &plan).unwrap();
        let rows_after_second = store.rows(RecordScope::Site, "H1", date(1));

        assert_eq!(rows_after_first.len(), 10_800);
        assert_eq!(rows_after_first, rows_after_second);
        assert_eq!(first, second);
        assert_eq!(first.sites["H1"].rows, 10_800);
        assert_eq!(rows_after_first[1].p_tot, 130.0);
        assert_eq!(rows_after_first[1].p_cons, 100.0);
        assert_eq!(store.raw.lock().unwrap()[&("H1".to_string(), date(1))].len(), 2 * 10_800);
        assert_eq!(store.marker("H1"), Some(date(1)));
    }

    #[test]
    fn failed_write_holds_marker_but_isolates_site() {
        let store = MemoryStore::default();
        store.fail_on("H1", date(1));
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(1)), Some(date(4))));
        let config = config();

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let report = orchestrator.run(&config, &[], &plan).unwrap();

        assert!(report.has_failures());
        assert_eq!(report.sites["H1"].days_failed, vec![date(1)]);
        assert_eq!(report.sites["H1"].days_synced, 2);
        assert_eq!(store.marker("H1"), None);
        assert_eq!(store.marker("H2"), Some(date(3)));
        assert_eq!(report.sites["H2"].last_synced, Some(date(3)));
        // 2 attempts for the failing day, 1 for each of the other five site-days.
        assert_eq!(*store.writes.lock().unwrap(), 7);
    }

    #[test]
    fn unavailable_sensor_is_reported_and_day_still_persisted() {
        let store = MemoryStore::default();
        let source = source().failing("B");
        let mut s = settings(Some(date(1)), Some(date(2)));
        s.missing_alert_ratio = Some(0.5);
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), s);
        let config = config();

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let report = orchestrator.run(&config, &[], &plan).unwrap();

        let h1 = &report.sites["H1"];
        assert_eq!(h1.unavailable_sensors, BTreeSet::from(["B".to_string()]));
        assert_eq!(h1.rows_with_gap, 10_800);
        assert_eq!(h1.cells_missing, 10_800);
        assert_eq!(h1.flagged_days, vec![date(1)]);
        assert!(report.sites["H2"].flagged_days.is_empty());
        assert_eq!(store.marker("H1"), Some(date(1)));
        assert_eq!(store.rows(RecordScope::Site, "H1", date(1))[1].p_tot, 100.0);
    }

    #[test]
    fn groups_are_merged_and_stored_separately() {
        let store = MemoryStore::default();
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(2)), Some(date(3))));
        let config = config();
        let groups = vec![SiteGroup {
            group_id: "G".to_string(),
            site_ids: vec!["H1".to_string(), "H2".to_string()],
        }];

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let report = orchestrator.run(&config, &groups, &plan).unwrap();

        let rows = store.rows(RecordScope::Group, "G", date(2));
        assert_eq!(rows.len(), 10_800);
        assert_eq!(rows[5].p_tot, 180.0);
        assert_eq!(rows[5].p_prod, 30.0);
        assert_eq!(rows[5].site_id, "G");
        assert_eq!(report.groups["G"].days_synced, 1);
        assert!(store.marker("G").is_none());
    }

    #[test]
    fn group_includes_members_not_planned_that_day() {
        let store = MemoryStore::default();
        store.set_last_synced_day("H1", date(2)).unwrap();
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(None, None));
        let config = config();
        let groups = vec![SiteGroup {
            group_id: "G".to_string(),
            site_ids: vec!["H1".to_string(), "H2".to_string()],
        }];

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(4)).unwrap();
        assert_eq!(plan.days["H1"], vec![date(3)]);
        assert_eq!(plan.days["H2"], vec![date(1), date(2), date(3)]);
        let report = orchestrator.run(&config, &groups, &plan).unwrap();

        assert!(!report.has_failures());
        assert_eq!(report.groups["G"].days_synced, 3);
        for day in [date(1), date(2), date(3)] {
            let rows = store.rows(RecordScope::Group, "G", day);
            assert_eq!(rows.len(), 10_800);
            assert_eq!(rows[5].p_tot, 180.0);
        }
        // The rebuilt member rows of days 1 and 2 are not written back.
        assert!(store.rows(RecordScope::Site, "H1", date(1)).is_empty());
        assert_eq!(store.marker("H1"), Some(date(3)));
        assert_eq!(*store.writes.lock().unwrap(), 7);
    }

    #[test]
    fn group_with_failed_member_is_skipped() {
        let store = MemoryStore::default();
        store.fail_on("H2", date(2));
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(2)), Some(date(3))));
        let config = config();
        let groups = vec![SiteGroup {
            group_id: "G".to_string(),
            site_ids: vec!["H1".to_string(), "H2".to_string()],
        }];

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let report = orchestrator.run(&config, &groups, &plan).unwrap();
        assert_eq!(report.groups["G"].days_failed, vec![date(2)]);
        assert!(store.rows(RecordScope::Group, "G", date(2)).is_empty());
    }

    #[test]
    fn dst_day_has_fewer_ticks() {
        let store = MemoryStore::default();
        let spring = NaiveDate::from_ymd_opt(2023, 3, 26).unwrap();
        let start = Utc.with_ymd_and_hms(2023, 3, 25, 0, 0, 0).unwrap();
        let source = StaticSource::default().with("C", ramp(start, 2 * 10_800, 0.05));
        let mut s = settings(Some(spring), Some(spring.succ_opt().unwrap()));
        s.timezone = chrono_tz::Europe::Brussels;
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), s);
        let config = Configuration::new(start, vec![row("H2", "C", 1, 0)]).unwrap();

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        orchestrator.run(&config, &[], &plan).unwrap();
        let rows = store.rows(RecordScope::Site, "H2", spring);
        assert_eq!(rows.len(), 23 * 450);
        assert!(rows.iter().all(|r| r.day == spring));
    }

    #[test]
    fn materialize_covers_arbitrary_window() {
        let store = MemoryStore::default();
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(None, None));
        let config = config();
        let since = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        let home = orchestrator
            .materialize(&config, "H2", since, since + TimeDelta::minutes(1))
            .unwrap();
        assert_eq!(home.raw_power().len(), 8);
        assert_eq!(home.cons_prod().p_tot()[3], 50.0);
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[test]
    fn days_with_missing_ticks_are_retried_until_complete() {
        let store = MemoryStore::default();
        let config = config();

        let broken = source().failing("B");
        let first = SyncOrchestrator::new(&broken, &store, converter(), settings(None, None));
        let plan = first.plan(&config, &BTreeMap::new(), date(3)).unwrap();
        assert!(plan.retried.is_empty());
        first.run(&config, &[], &plan).unwrap();
        assert_eq!(store.marker("H1"), Some(date(2)));
        assert_eq!(store.gap_days("H1", date(1), date(3)).unwrap(), vec![date(1), date(2)]);
        assert!(store.gap_days("H2", date(1), date(3)).unwrap().is_empty());

        let healthy = source();
        let second = SyncOrchestrator::new(&healthy, &store, converter(), settings(None, None));
        let plan = second.plan(&config, &BTreeMap::new(), date(4)).unwrap();
        // Day 1 is outside the two-day lookback.
        assert_eq!(plan.retried["H1"], vec![date(2)]);
        assert!(!plan.retried.contains_key("H2"));
        assert_eq!(plan.days["H1"], vec![date(2), date(3)]);
        assert_eq!(plan.days["H2"], vec![date(3)]);

        let report = second.run(&config, &[], &plan).unwrap();
        assert_eq!(report.sites["H1"].rows_with_gap, 0);
        assert_eq!(store.rows(RecordScope::Site, "H1", date(2))[1].p_tot, 130.0);
        assert_eq!(store.marker("H1"), Some(date(3)));

        let plan = second.plan(&config, &BTreeMap::new(), date(4)).unwrap();
        assert!(plan.is_empty());
        assert!(plan.retried.is_empty());
    }

    #[test]
    fn failed_retry_of_covered_day_does_not_hold_marker() {
        let store = MemoryStore::default();
        store.set_last_synced_day("H1", date(2)).unwrap();
        store.set_last_synced_day("H2", date(3)).unwrap();
        store.with_gap("H1", "B", date(2));
        store.fail_on("H1", date(2));
        let source = source();
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(None, None));
        let config = config();

        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(4)).unwrap();
        assert_eq!(plan.days["H1"], vec![date(2), date(3)]);
        let report = orchestrator.run(&config, &[], &plan).unwrap();

        assert_eq!(report.sites["H1"].days_failed, vec![date(2)]);
        assert_eq!(store.marker("H1"), Some(date(3)));
        assert_eq!(store.gap_days("H1", date(2), date(3)).unwrap(), vec![date(2)]);
    }

    #[test]
    fn gap_retry_is_off_for_manual_windows_and_zero_days() {
        let store = MemoryStore::default();
        store.set_last_synced_day("H1", date(2)).unwrap();
        store.with_gap("H1", "B", date(2));
        let source = source();
        let config = config();

        let manual = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(3)), None));
        assert!(manual.plan(&config, &BTreeMap::new(), date(4)).unwrap().retried.is_empty());

        let mut s = settings(None, None);
        s.gap_retry_days = 0;
        let disabled = SyncOrchestrator::new(&source, &store, converter(), s);
        let plan = disabled.plan(&config, &BTreeMap::new(), date(4)).unwrap();
        assert_eq!(plan.days["H1"], vec![date(3)]);
    }

    #[test]
    fn sign_check_flags_positive_production_above_tolerance() {
        let store = MemoryStore::default();
        let source = source();
        let config = config();

        let mut s = settings(Some(date(1)), Some(date(2)));
        s.sign_alert_tolerance = Some(15.0);
        let strict = SyncOrchestrator::new(&source, &store, converter(), s);
        let plan = strict.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        let report = strict.run(&config, &[], &plan).unwrap();
        // H1's sensor B produces 30 W.
        assert_eq!(report.sites["H1"].sign_flagged_days, vec![date(1)]);
        assert!(report.sites["H2"].sign_flagged_days.is_empty());

        let mut s = settings(Some(date(1)), Some(date(2)));
        s.sign_alert_tolerance = Some(40.0);
        let lenient = SyncOrchestrator::new(&source, &store, converter(), s);
        let report = lenient.run(&config, &[], &plan).unwrap();
        assert!(report.sites["H1"].sign_flagged_days.is_empty());
    }

    #[test]
    fn recompute_applies_latest_coefficients_to_stored_power() {
        let store = MemoryStore::default();
        let source = source();
        let config = config();
        let groups = vec![SiteGroup {
            group_id: "G".to_string(),
            site_ids: vec!["H1".to_string(), "H2".to_string()],
        }];
        let orchestrator = SyncOrchestrator::new(&source, &store, converter(), settings(Some(date(1)), Some(date(3))));
        let plan = orchestrator.plan(&config, &BTreeMap::new(), date(9)).unwrap();
        orchestrator.run(&config, &groups, &plan).unwrap();
        let writes = *store.writes.lock().unwrap();

        let updated = Configuration::new(
            Utc.with_ymd_and_hms(2023, 1, 5, 0, 0, 0).unwrap(),
            vec![row("H1", "A", -1, 0), row("H1", "B", 1, 1), row("H2", "C", 1, 0)],
        )
        .unwrap();
        // Nothing is fetched: every sensor would fail.
        let offline = source.failing("A").failing("B").failing("C");
        let recompute = SyncOrchestrator::new(&offline, &store, converter(), settings(None, Some(date(2))));
        let report = recompute.recompute(&updated, &groups).unwrap();

        assert!(!report.has_failures());
        assert_eq!(report.sites["H1"].days_synced, 1);
        assert_eq!(report.groups["G"].days_synced, 1);
        let h1 = store.rows(RecordScope::Site, "H1", date(1));
        assert_eq!(h1.len(), 10_800);
        assert_eq!((h1[1].p_tot, h1[1].p_prod, h1[1].p_cons), (-70.0, 30.0, -100.0));
        assert_eq!(store.rows(RecordScope::Group, "G", date(1))[5].p_tot, -20.0);
        // Day 2 is outside the window and keeps the old coefficients.
        assert_eq!(store.rows(RecordScope::Site, "H1", date(2))[1].p_tot, 130.0);
        assert_eq!(store.marker("H1"), Some(date(2)));
        // H1, H2 and G for day 1.
        assert_eq!(*store.writes.lock().unwrap(), writes + 3);
    }
}
