use chrono::{Datelike, Months, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::limits::{MAX_CALENDAR_YEAR, MIN_CALENDAR_YEAR};
use crate::model::{Ms, Span};

/// Turns calendar days and months into instant windows in one time zone.
///
/// A day covers `[00:00:00.000, 23:59:59.999]` local time, represented as the
/// half-open span `[midnight, next midnight)`. DST days are 23 or 25 hours long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    tz: Tz,
}

impl Default for Calendar {
    fn default() -> Self {
        Self { tz: Tz::UTC }
    }
}

impl Calendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Validate calendar components and build the date.
    pub fn date(year: i32, month: u32, day: u32) -> Result<NaiveDate, EngineError> {
        let invalid = || EngineError::InvalidDate(format!("{year:04}-{month:02}-{day:02}"));
        if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&year) || !(1..=12).contains(&month) {
            return Err(invalid());
        }
        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
    }

    pub fn days_in_month(year: i32, month: u32) -> Result<u32, EngineError> {
        let first = Self::first_of_month(year, month)?;
        let next = next_month(first)?;
        Ok(next.signed_duration_since(first).num_days() as u32)
    }

    pub fn day_window(&self, year: i32, month: u32, day: u32) -> Result<Span, EngineError> {
        let date = Self::date(year, month, day)?;
        let next = date
            .succ_opt()
            .ok_or_else(|| EngineError::InvalidDate(date.to_string()))?;
        Ok(Span::new(self.start_of_day(date), self.start_of_day(next)))
    }

    pub fn month_window(&self, year: i32, month: u32) -> Result<Span, EngineError> {
        let first = Self::first_of_month(year, month)?;
        let next = next_month(first)?;
        Ok(Span::new(self.start_of_day(first), self.start_of_day(next)))
    }

    /// Local calendar date an instant falls on.
    pub fn date_of(&self, t: Ms) -> Option<NaiveDate> {
        self.tz.timestamp_millis_opt(t).single().map(|dt| dt.date_naive())
    }

    fn first_of_month(year: i32, month: u32) -> Result<NaiveDate, EngineError> {
        if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&year) || !(1..=12).contains(&month) {
            return Err(EngineError::InvalidDate(format!("{year:04}-{month:02}")));
        }
        NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| EngineError::InvalidDate(format!("{year:04}-{month:02}")))
    }

    /// First local instant of `date`. When midnight falls into a DST gap the
    /// day starts at the first wall-clock time that exists.
    fn start_of_day(&self, date: NaiveDate) -> Ms {
        let midnight = date.and_time(NaiveTime::MIN);
        let mut probe = midnight;
        for _ in 0..=8 {
            if let Some(t) = self.tz.from_local_datetime(&probe).earliest() {
                return t.timestamp_millis();
            }
            probe += TimeDelta::minutes(15);
        }
        self.tz.from_utc_datetime(&midnight).timestamp_millis()
    }
}

fn next_month(first: NaiveDate) -> Result<NaiveDate, EngineError> {
    first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| EngineError::InvalidDate(format!("{:04}-{:02}", first.year(), first.month())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const DAY: Ms = 24 * H;

    #[test]
    fn utc_day_window() {
        let cal = Calendar::default();
        let w = cal.day_window(2024, 2, 3).unwrap();
        // 2024-02-03T00:00:00Z
        assert_eq!(w.start, 1_706_918_400_000);
        assert_eq!(w.duration_ms(), DAY);
    }

    #[test]
    fn invalid_calendar_components() {
        let cal = Calendar::default();
        assert!(matches!(cal.day_window(2024, 2, 30), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.day_window(2023, 2, 29), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.day_window(2024, 13, 1), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.day_window(2024, 0, 1), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.day_window(2024, 4, 31), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.day_window(2024, 1, 0), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.month_window(2024, 13), Err(EngineError::InvalidDate(_))));
        assert!(matches!(cal.month_window(1969, 12), Err(EngineError::InvalidDate(_))));
        assert!(cal.day_window(2024, 2, 29).is_ok());
    }

    #[test]
    fn month_window_covers_all_days() {
        let cal = Calendar::default();
        let month = cal.month_window(2024, 2).unwrap();
        let first = cal.day_window(2024, 2, 1).unwrap();
        let last = cal.day_window(2024, 2, 29).unwrap();
        assert_eq!(month.start, first.start);
        assert_eq!(month.end, last.end);
        assert_eq!(month.duration_ms(), 29 * DAY);
    }

    #[test]
    fn december_rolls_into_next_year() {
        let cal = Calendar::default();
        let dec = cal.month_window(2023, 12).unwrap();
        let jan = cal.day_window(2024, 1, 1).unwrap();
        assert_eq!(dec.end, jan.start);
    }

    #[test]
    fn days_in_month_values() {
        assert_eq!(Calendar::days_in_month(2024, 2).unwrap(), 29);
        assert_eq!(Calendar::days_in_month(2023, 2).unwrap(), 28);
        assert_eq!(Calendar::days_in_month(2024, 4).unwrap(), 30);
        assert_eq!(Calendar::days_in_month(2024, 12).unwrap(), 31);
        assert!(Calendar::days_in_month(2024, 0).is_err());
    }

    #[test]
    fn tokyo_day_starts_nine_hours_before_utc() {
        let cal = Calendar::new(chrono_tz::Asia::Tokyo);
        let tokyo = cal.day_window(2024, 2, 3).unwrap();
        let utc = Calendar::default().day_window(2024, 2, 3).unwrap();
        assert_eq!(utc.start - tokyo.start, 9 * H);
        assert_eq!(tokyo.duration_ms(), DAY);
    }

    #[test]
    fn dst_days_have_local_length() {
        let cal = Calendar::new(chrono_tz::America::New_York);
        // 2024-03-10 spring forward, 2024-11-03 fall back.
        assert_eq!(cal.day_window(2024, 3, 10).unwrap().duration_ms(), 23 * H);
        assert_eq!(cal.day_window(2024, 11, 3).unwrap().duration_ms(), 25 * H);
    }

    #[test]
    fn midnight_in_dst_gap_starts_at_first_valid_time() {
        // Santiago skips 00:00-01:00 on 2024-09-08.
        let cal = Calendar::new(chrono_tz::America::Santiago);
        let w = cal.day_window(2024, 9, 8).unwrap();
        assert_eq!(w.duration_ms(), 23 * H);
        assert_eq!(cal.day_window(2024, 9, 7).unwrap().end, w.start);
    }

    #[test]
    fn date_of_instant() {
        let cal = Calendar::new(chrono_tz::Asia::Tokyo);
        let w = cal.day_window(2024, 2, 3).unwrap();
        assert_eq!(cal.date_of(w.start), NaiveDate::from_ymd_opt(2024, 2, 3));
        assert_eq!(cal.date_of(w.end - 1), NaiveDate::from_ymd_opt(2024, 2, 3));
        assert_eq!(cal.date_of(w.end), NaiveDate::from_ymd_opt(2024, 2, 4));
    }
}
