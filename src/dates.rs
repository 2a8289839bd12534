// src/dates.rs

use chrono::{Datelike, Duration, Local, NaiveDate};
use serde::Deserialize;

use crate::error::PipelineError;

/// How often a dataset is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Monthly,
    Yearly,
}

impl Cadence {
    /// Advance `date` by one publication step.
    ///
    /// Monthly keeps the day-of-month; yearly adds the number of days in the
    /// *current* year, so a Feb 29 start drifts to Mar 1 rather than clamping.
    pub fn step(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Cadence::Daily => date.succ_opt(),
            Cadence::Monthly => {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, date.day())
            }
            Cadence::Yearly => {
                let days = if is_leap_year(date.year()) { 366 } else { 365 };
                date.checked_add_signed(Duration::days(days))
            }
        }
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Half-open `[start, end)` range of publication instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub cadence: Cadence,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, cadence: Cadence) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::config(format!(
                "date window starts after it ends ({} > {})",
                start, end
            )));
        }
        // monthly stepping is only defined for days every month has
        if cadence == Cadence::Monthly && start.day() > 28 {
            return Err(PipelineError::config(format!(
                "monthly cadence cannot start on day {} ({})",
                start.day(),
                start
            )));
        }
        Ok(Self { start, end, cadence })
    }

    /// Lazily generate every instant of the window. Can be called repeatedly.
    pub fn dates(&self) -> CadenceIter {
        CadenceIter {
            next: Some(self.start),
            end: self.end,
            cadence: self.cadence,
        }
    }
}

/// Iterator returned by [`DateWindow::dates`].
#[derive(Debug, Clone)]
pub struct CadenceIter {
    next: Option<NaiveDate>,
    end: NaiveDate,
    cadence: Cadence,
}

impl Iterator for CadenceIter {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let current = self.next.filter(|d| *d < self.end)?;
        self.next = self.cadence.step(current);
        Some(current)
    }
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// A date inside the previous month (today minus `day + 1` days).
pub fn last_month() -> NaiveDate {
    let now = today();
    now - Duration::days(i64::from(now.day()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn monthly_keeps_day_and_counts_months() {
        let window = DateWindow::new(ymd(2020, 4, 1), ymd(2021, 2, 1), Cadence::Monthly).unwrap();
        let dates: Vec<_> = window.dates().collect();
        assert_eq!(dates.len(), 10);
        assert!(dates.iter().all(|d| d.day() == 1));
        assert_eq!(dates[8], ymd(2020, 12, 1));
        assert_eq!(dates[9], ymd(2021, 1, 1));
    }

    #[test]
    fn monthly_mid_month_start() {
        let window = DateWindow::new(ymd(2019, 11, 15), ymd(2020, 3, 1), Cadence::Monthly).unwrap();
        let dates: Vec<_> = window.dates().collect();
        assert_eq!(
            dates,
            vec![ymd(2019, 11, 15), ymd(2019, 12, 15), ymd(2020, 1, 15), ymd(2020, 2, 15)]
        );
    }

    #[test]
    fn end_is_excluded() {
        let window = DateWindow::new(ymd(2020, 1, 1), ymd(2020, 1, 5), Cadence::Daily).unwrap();
        let dates: Vec<_> = window.dates().collect();
        assert_eq!(dates.len(), 4);
        assert!(dates.iter().all(|d| *d >= window.start && *d < window.end));
        assert_eq!(*dates.last().unwrap(), ymd(2020, 1, 4));
    }

    #[test]
    fn empty_window_yields_nothing() {
        let window = DateWindow::new(ymd(2020, 1, 1), ymd(2020, 1, 1), Cadence::Daily).unwrap();
        assert_eq!(window.dates().count(), 0);
    }

    #[test]
    fn yearly_adds_days_of_current_year() {
        let window = DateWindow::new(ymd(2014, 1, 1), ymd(2018, 1, 1), Cadence::Yearly).unwrap();
        let dates: Vec<_> = window.dates().collect();
        assert_eq!(
            dates,
            vec![ymd(2014, 1, 1), ymd(2015, 1, 1), ymd(2016, 1, 1), ymd(2017, 1, 1)]
        );

        // leap-day start drifts instead of clamping
        assert_eq!(Cadence::Yearly.step(ymd(2020, 2, 29)), Some(ymd(2021, 3, 1)));
    }

    #[test]
    fn restartable() {
        let window = DateWindow::new(ymd(2020, 1, 1), ymd(2020, 6, 1), Cadence::Monthly).unwrap();
        let first: Vec<_> = window.dates().collect();
        let second: Vec<_> = window.dates().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_inverted_and_unsteppable_windows() {
        assert!(DateWindow::new(ymd(2020, 2, 1), ymd(2020, 1, 1), Cadence::Daily).is_err());
        assert!(DateWindow::new(ymd(2020, 1, 31), ymd(2020, 6, 1), Cadence::Monthly).is_err());
    }
}
