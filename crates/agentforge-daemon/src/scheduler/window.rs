//! UTC window math for schedules.
//!
//! An occurrence belongs to the weekday it starts on, so a Monday 23:00
//! window of two hours runs until Tuesday 01:00 even when Tuesday is not a
//! scheduled day.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};

use agentforge_core::model::Schedule;

/// Days scanned forward by [`next_window_start`].
const LOOKAHEAD_DAYS: u64 = 8;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn start_ts(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_ts(&self) -> i64 {
        self.end.timestamp()
    }
}

fn occurrence_on(schedule: &Schedule, start_time: NaiveTime, date: NaiveDate) -> Option<Window> {
    use chrono::Datelike;

    if !schedule.weekdays.contains(date.weekday()) {
        return None;
    }
    let start = date.and_time(start_time).and_utc();
    let end = start + TimeDelta::minutes(i64::from(schedule.duration_minutes));
    Some(Window { start, end })
}

/// The occurrence `now` falls into, if any. Checks today's and yesterday's
/// start so windows crossing midnight are found.
pub fn current_window(schedule: &Schedule, now: DateTime<Utc>) -> Option<Window> {
    let start_time = schedule.start_naive_time().ok()?;
    let today = now.date_naive();
    [Some(today), today.checked_sub_days(Days::new(1))]
        .into_iter()
        .flatten()
        .filter_map(|date| occurrence_on(schedule, start_time, date))
        .find(|w| w.contains(now))
}

/// First occurrence starting strictly after `now`.
pub fn next_window(schedule: &Schedule, now: DateTime<Utc>) -> Option<Window> {
    let start_time = schedule.start_naive_time().ok()?;
    let today = now.date_naive();
    (0..=LOOKAHEAD_DAYS)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter_map(|date| occurrence_on(schedule, start_time, date))
        .find(|w| w.start > now)
}

pub fn next_window_start(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_window(schedule, now).map(|w| w.start)
}

/// Most recent occurrence that has fully ended by `now`.
pub fn last_completed_window(schedule: &Schedule, now: DateTime<Utc>) -> Option<Window> {
    let start_time = schedule.start_naive_time().ok()?;
    let today = now.date_naive();
    (0..=LOOKAHEAD_DAYS)
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .filter_map(|date| occurrence_on(schedule, start_time, date))
        .find(|w| w.end <= now)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use agentforge_core::model::{RunSettings, Weekdays};
    use chrono::{TimeZone, Weekday};

    fn schedule(days: &[Weekday], start: &str, minutes: u32) -> Schedule {
        Schedule {
            id: 1,
            weekdays: days.iter().copied().collect::<Weekdays>(),
            start_time: start.to_string(),
            duration_minutes: minutes,
            enabled: true,
            paused: false,
            skip_next: false,
            skip_until: None,
            overrides: RunSettings::default(),
            failed_window_start: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn monday_morning_window() {
        // 2026-10-19 is a Monday.
        let s = schedule(&[Weekday::Mon], "09:00", 60);
        let window = current_window(&s, at(2026, 10, 19, 9, 30)).unwrap();
        assert_eq!(window.start, at(2026, 10, 19, 9, 0));
        assert_eq!(window.end, at(2026, 10, 19, 10, 0));

        assert!(current_window(&s, at(2026, 10, 19, 10, 0)).is_none());
        assert!(current_window(&s, at(2026, 10, 19, 8, 59)).is_none());
        assert!(current_window(&s, at(2026, 10, 20, 9, 30)).is_none());
    }

    #[test]
    fn window_crossing_midnight_belongs_to_start_day() {
        let s = schedule(&[Weekday::Mon], "23:00", 120);
        let window = current_window(&s, at(2026, 10, 20, 0, 30)).unwrap();
        assert_eq!(window.start, at(2026, 10, 19, 23, 0));
        assert!(current_window(&s, at(2026, 10, 20, 1, 0)).is_none());

        let sunday = schedule(&[Weekday::Sun], "23:00", 120);
        assert!(current_window(&sunday, at(2026, 10, 20, 0, 30)).is_none());
    }

    #[test]
    fn next_start_skips_unscheduled_days() {
        let s = schedule(&[Weekday::Wed], "06:15", 30);
        assert_eq!(
            next_window_start(&s, at(2026, 10, 19, 12, 0)),
            Some(at(2026, 10, 21, 6, 15))
        );
        assert_eq!(
            next_window_start(&s, at(2026, 10, 21, 6, 15)),
            Some(at(2026, 10, 28, 6, 15))
        );
    }

    #[test]
    fn last_completed_window_looks_back() {
        let s = schedule(&[Weekday::Fri], "09:00", 60);
        let window = last_completed_window(&s, at(2026, 10, 19, 12, 0)).unwrap();
        assert_eq!(window.start, at(2026, 10, 16, 9, 0));
        assert!(last_completed_window(&s, at(2026, 10, 16, 9, 30))
            .is_some_and(|w| w.start == at(2026, 10, 9, 9, 0)));
    }

    #[test]
    fn invalid_start_time_never_matches() {
        let s = schedule(&[Weekday::Mon], "25:00", 60);
        assert!(current_window(&s, at(2026, 10, 19, 9, 0)).is_none());
        assert!(next_window_start(&s, at(2026, 10, 19, 9, 0)).is_none());
    }
}
