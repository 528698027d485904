//! Trading calendar: date/weekday filtering and period boundaries.

use crate::config::MtmFrequency;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};

/// Data-index positions inside `[start, end]` that fall on a trading weekday.
///
/// An empty `weekdays` list accepts every day present in the data.
pub fn build_calendar(
    index: &[NaiveDateTime],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    weekdays: &[Weekday],
) -> Vec<usize> {
    index
        .iter()
        .enumerate()
        .filter(|(_, ts)| {
            let d = ts.date();
            start.map_or(true, |s| d >= s)
                && end.map_or(true, |e| d <= e)
                && (weekdays.is_empty() || weekdays.contains(&d.weekday()))
        })
        .map(|(i, _)| i)
        .collect()
}

pub fn new_day(prev: NaiveDateTime, now: NaiveDateTime) -> bool {
    prev.date() != now.date()
}

/// Weeks start on Monday (ISO weeks).
pub fn new_week(prev: NaiveDateTime, now: NaiveDateTime) -> bool {
    prev.date().iso_week() != now.date().iso_week()
}

pub fn new_month(prev: NaiveDateTime, now: NaiveDateTime) -> bool {
    (prev.year(), prev.month()) != (now.year(), now.month())
}

/// Whether the bar at `now` is marked, given the next calendar timestamp.
///
/// Period frequencies mark the last calendar bar of each period; the final
/// bar always marks.
pub fn mtm_due(freq: MtmFrequency, now: NaiveDateTime, next: Option<NaiveDateTime>) -> bool {
    let Some(next) = next else {
        return true;
    };
    match freq {
        MtmFrequency::EveryBar => true,
        MtmFrequency::Daily => new_day(now, next),
        MtmFrequency::Weekly => new_week(now, next),
        MtmFrequency::Monthly => new_month(now, next),
    }
}
