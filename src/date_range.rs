use crate::error::Error;
use chrono::{Datelike, Local, Months, NaiveDate};
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Reporting window. Both bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::StartDateAfterEndDate {
                start_date: start.to_string(),
                end_date: end.to_string(),
            });
        }
        Ok(DateRange { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of days covered, counting both ends.
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Splits the range into consecutive sub-ranges that never cross a
    /// calendar month boundary.
    pub fn monthly_chunks(&self) -> Vec<DateRange> {
        let mut chunks = vec![];
        let mut chunk_start = self.start;

        loop {
            let month_end = last_day_of_month(chunk_start);
            let chunk_end = month_end.min(self.end);
            chunks.push(DateRange {
                start: chunk_start,
                end: chunk_end,
            });

            match chunk_end.succ_opt() {
                Some(next) if chunk_end < self.end => chunk_start = next,
                _ => break,
            }
        }

        chunks
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Resolves the reporting window.
///
/// Explicit bounds win. A missing end defaults to `today` and a missing start
/// is derived from the end by stepping back `lookback_years` years and
/// `lookback_months` months, clamping the day when the target month is
/// shorter (e.g. 31 March minus one month is 28 or 29 February).
pub fn resolve(
    explicit_start: Option<&str>,
    explicit_end: Option<&str>,
    lookback_years: u32,
    lookback_months: u32,
    today: NaiveDate,
) -> Result<DateRange, Error> {
    let end = match explicit_end {
        Some(raw) => parse_date(raw)?,
        None => today,
    };

    let start = match explicit_start {
        Some(raw) => parse_date(raw)?,
        None => {
            let months = lookback_years
                .checked_mul(12)
                .and_then(|m| m.checked_add(lookback_months))
                .ok_or_else(|| Error::InvalidDate {
                    date: format!(
                        "{} minus {} years and {} months",
                        end, lookback_years, lookback_months
                    ),
                })?;
            end.checked_sub_months(Months::new(months))
                .ok_or_else(|| Error::InvalidDate {
                    date: format!("{} minus {} months", end, months),
                })?
        }
    };

    DateRange::new(start, end)
}

/// [`resolve`] against the local calendar date.
pub fn resolve_today(
    explicit_start: Option<&str>,
    explicit_end: Option<&str>,
    lookback_years: u32,
    lookback_months: u32,
) -> Result<DateRange, Error> {
    resolve(
        explicit_start,
        explicit_end,
        lookback_years,
        lookback_months,
        Local::now().date_naive(),
    )
}

/// Parses a strict `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, Error> {
    let invalid = || Error::InvalidDate {
        date: raw.to_string(),
    };

    let parts = raw
        .trim()
        .split('-')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    match parts.as_slice() {
        &[year, month, day] if year >= 1000 && month <= 12 && day <= 31 => {
            NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let first = date.with_day(1).unwrap_or(date);
    first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}
