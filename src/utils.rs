use crate::error::{MarginError, Result};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub fn validate_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(MarginError::InvalidArgument(format!(
            "Invalid month {}: must be between 1 and 12",
            month
        )));
    }
    Ok(())
}

pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Number of the last calendar day in `month` of `year`.
pub fn last_day_of_month(month: u32, year: i32) -> Result<u32> {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => Ok(31),
        4 | 6 | 9 | 11 => Ok(30),
        2 if is_leap_year(year) => Ok(29),
        2 => Ok(28),
        _ => Err(MarginError::InvalidArgument(format!(
            "Invalid month {}: must be between 1 and 12",
            month
        ))),
    }
}

/// Returns (first_day, last_day) of the calendar month.
pub fn month_bounds(month: u32, year: i32) -> Result<(NaiveDate, NaiveDate)> {
    let last = last_day_of_month(month, year)?;

    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        MarginError::InvalidArgument(format!("Year {} is out of range", year))
    })?;
    let end = NaiveDate::from_ymd_opt(year, month, last).ok_or_else(|| {
        MarginError::InvalidArgument(format!("Year {} is out of range", year))
    })?;

    Ok((start, end))
}

/// An inclusive range of calendar months inside one year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MonthRange {
    #[schemars(description = "First month of the range (1 = January)")]
    pub start: u32,

    #[schemars(description = "Last month of the range, inclusive (12 = December)")]
    pub end: u32,
}

impl MonthRange {
    pub fn new(start: u32, end: u32) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn full_year() -> Self {
        Self { start: 1, end: 12 }
    }

    pub fn validate(&self) -> Result<()> {
        validate_month(self.start)?;
        validate_month(self.end)?;
        if self.end < self.start {
            return Err(MarginError::InvalidArgument(format!(
                "Month range {}:{} ends before it starts",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn months(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end + 1).saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MonthRange {
    fn default() -> Self {
        Self::full_year()
    }
}

/// Parses a month range in the format "MM" or "MM:MM" (e.g. "7:12").
pub fn parse_month_range(range: &str) -> Result<MonthRange> {
    let parts: Vec<&str> = range.split(':').collect();

    let parse_part = |part: &str| -> Result<u32> {
        part.trim().parse::<u32>().map_err(|_| {
            MarginError::InvalidArgument(format!(
                "Invalid month '{}' in range '{}'. Expected MM or MM:MM",
                part, range
            ))
        })
    };

    match parts.len() {
        1 => {
            let month = parse_part(parts[0])?;
            MonthRange::new(month, month)
        }
        2 => MonthRange::new(parse_part(parts[0])?, parse_part(parts[1])?),
        _ => Err(MarginError::InvalidArgument(format!(
            "Invalid month range: {}. Expected 'MM' or 'MM:MM'",
            range
        ))),
    }
}
