use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

/// First instant of `day` in `tz`.
///
/// Zones that skip midnight on a DST switch start the day at the first local
/// time that exists.
pub fn local_midnight(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let mut naive = day.and_time(NaiveTime::MIN);
    for _ in 0..4 {
        if let Some(local) = tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
        naive += TimeDelta::hours(1);
    }
    day.and_time(NaiveTime::MIN).and_utc()
}

/// `[midnight, next midnight)` of a civil day, as UTC instants.
pub fn day_window(day: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = day.succ_opt().unwrap_or(day);
    (local_midnight(day, tz), local_midnight(next, tz))
}

pub fn local_day(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Days in `[from, until)`.
pub fn days_between(from: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d < until).collect()
}

/// Round to one decimal; never yields `-0.0`.
pub fn round1(value: f64) -> f64 {
    let rounded = (value * 10.0).round() / 10.0;
    if rounded == 0.0 { 0.0 } else { rounded }
}

pub fn format_window(since: DateTime<Utc>, until: DateTime<Utc>) -> String {
    format!(
        "[{}, {})",
        since.to_rfc3339_opts(SecondsFormat::Secs, true),
        until.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}
