use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::run::RunSettings;
use crate::error::Error;

/// Longest allowed window (24 hours).
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Set of weekdays stored as a bitmask (Mon = 1 .. Sun = 64).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Self = Self(0b111_1111);
    pub const WORKDAYS: Self = Self(0b001_1111);

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= Self::bit(day);
    }

    pub fn days(self) -> impl Iterator<Item = Weekday> {
        WEEK.into_iter().filter(move |d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for Weekdays {
    fn from_iter<T: IntoIterator<Item = Weekday>>(iter: T) -> Self {
        let mut days = Self::default();
        for day in iter {
            days.insert(day);
        }
        days
    }
}

impl TryFrom<u8> for Weekdays {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        if bits & !Self::ALL.0 != 0 {
            return Err(Error::Validation(format!("invalid weekday mask: {bits}")));
        }
        Ok(Self(bits))
    }
}

impl From<Weekdays> for u8 {
    fn from(days: Weekdays) -> Self {
        days.0
    }
}

impl FromStr for Weekdays {
    type Err = Error;

    /// Accepts `daily`, `weekdays`, `weekends` or a comma list like `mon,wed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "all" => return Ok(Self::ALL),
            "weekdays" => return Ok(Self::WORKDAYS),
            "weekends" => return Ok([Weekday::Sat, Weekday::Sun].into_iter().collect()),
            _ => {}
        }
        s.split(',')
            .map(|part| {
                part.trim()
                    .parse::<Weekday>()
                    .map_err(|_| Error::Validation(format!("unknown weekday: {part}")))
            })
            .collect()
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.days().map(|d| d.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

/// Parse a UTC `HH:MM` start time.
pub fn parse_start_time(s: &str) -> Result<NaiveTime, Error> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| Error::Validation(format!("start time must be HH:MM, got {s:?}")))
}

fn validate_window(weekdays: Weekdays, start_time: &str, duration_minutes: u32) -> Result<(), Error> {
    if weekdays.is_empty() {
        return Err(Error::Validation("schedule needs at least one weekday".into()));
    }
    parse_start_time(start_time)?;
    if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
        return Err(Error::Validation(format!(
            "duration must be between 1 and {MAX_DURATION_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// A recurring UTC run window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub weekdays: Weekdays,
    /// UTC `HH:MM`.
    pub start_time: String,
    pub duration_minutes: u32,
    pub enabled: bool,
    pub paused: bool,
    /// One-shot skip of the next (or current) occurrence.
    pub skip_next: bool,
    /// End of the window the skip applies to.
    pub skip_until: Option<i64>,
    pub overrides: RunSettings,
    /// Start of the last occurrence marked failed.
    pub failed_window_start: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Schedule {
    pub fn start_naive_time(&self) -> Result<NaiveTime, Error> {
        parse_start_time(&self.start_time)
    }

    /// Enabled and not paused.
    pub const fn is_active(&self) -> bool {
        self.enabled && !self.paused
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub weekdays: Weekdays,
    pub start_time: String,
    pub duration_minutes: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub overrides: RunSettings,
}

const fn default_true() -> bool {
    true
}

impl NewSchedule {
    pub fn validate(&self) -> Result<(), Error> {
        validate_window(self.weekdays, &self.start_time, self.duration_minutes)
    }
}

/// Partial schedule update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleUpdate {
    pub weekdays: Option<Weekdays>,
    pub start_time: Option<String>,
    pub duration_minutes: Option<u32>,
    pub enabled: Option<bool>,
    pub paused: Option<bool>,
    pub overrides: Option<RunSettings>,
}

impl ScheduleUpdate {
    /// Apply onto `schedule`, validating the resulting window.
    pub fn apply(self, schedule: &mut Schedule) -> Result<(), Error> {
        let weekdays = self.weekdays.unwrap_or(schedule.weekdays);
        let start_time = self.start_time.unwrap_or_else(|| schedule.start_time.clone());
        let duration = self.duration_minutes.unwrap_or(schedule.duration_minutes);
        validate_window(weekdays, &start_time, duration)?;

        schedule.weekdays = weekdays;
        schedule.start_time = start_time;
        schedule.duration_minutes = duration;
        if let Some(enabled) = self.enabled {
            schedule.enabled = enabled;
        }
        if let Some(paused) = self.paused {
            schedule.paused = paused;
        }
        if let Some(overrides) = self.overrides {
            schedule.overrides = overrides;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn weekdays_parse_lists_and_aliases() {
        let days: Weekdays = "mon, wed".parse().unwrap();
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Wed));
        assert!(!days.contains(Weekday::Tue));
        assert_eq!(days.bits(), 0b101);

        assert_eq!("weekdays".parse::<Weekdays>().unwrap(), Weekdays::WORKDAYS);
        assert_eq!("daily".parse::<Weekdays>().unwrap(), Weekdays::ALL);
        assert!("funday".parse::<Weekdays>().is_err());
    }

    #[test]
    fn weekdays_reject_high_bits() {
        assert!(Weekdays::try_from(0x80).is_err());
        assert!(serde_json::from_str::<Weekdays>("200").is_err());
        assert_eq!(serde_json::from_str::<Weekdays>("1").unwrap().to_string(), "Mon");
    }

    #[test]
    fn new_schedule_validation() {
        let mut s = NewSchedule {
            weekdays: Weekdays::ALL,
            start_time: "09:00".into(),
            duration_minutes: 60,
            enabled: true,
            overrides: RunSettings::default(),
        };
        assert!(s.validate().is_ok());

        s.start_time = "9am".into();
        assert!(s.validate().is_err());

        s.start_time = "23:30".into();
        s.duration_minutes = 0;
        assert!(s.validate().is_err());
        s.duration_minutes = MAX_DURATION_MINUTES + 1;
        assert!(s.validate().is_err());

        s.duration_minutes = 90;
        s.weekdays = Weekdays::default();
        assert!(s.validate().is_err());
    }

    #[test]
    fn update_rejects_invalid_result_without_mutation() {
        let mut schedule = Schedule {
            id: 1,
            weekdays: Weekdays::ALL,
            start_time: "09:00".into(),
            duration_minutes: 60,
            enabled: true,
            paused: false,
            skip_next: false,
            skip_until: None,
            overrides: RunSettings::default(),
            failed_window_start: None,
            created_at: 0,
            updated_at: 0,
        };
        let before = schedule.clone();
        let bad = ScheduleUpdate {
            start_time: Some("25:00".into()),
            paused: Some(true),
            ..ScheduleUpdate::default()
        };
        assert!(bad.apply(&mut schedule).is_err());
        assert_eq!(schedule, before);

        let good = ScheduleUpdate {
            duration_minutes: Some(120),
            paused: Some(true),
            ..ScheduleUpdate::default()
        };
        good.apply(&mut schedule).unwrap();
        assert_eq!(schedule.duration_minutes, 120);
        assert!(!schedule.is_active());
    }
}
