// src/week_range.rs

use chrono::{Datelike, Days, NaiveDate, Weekday};

/// One Monday-anchored calendar week inside a query range.
///
/// `monday`/`sunday` are the full calendar week and are what records are
/// matched against; `display_start`/`display_end` are clipped to the query
/// range and are what the caller sees. A record on a Tuesday belongs to its
/// calendar week even when the query range starts on the Wednesday after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekSpan {
    pub monday: NaiveDate,
    pub sunday: NaiveDate,
    pub display_start: NaiveDate,
    pub display_end: NaiveDate,
}

impl WeekSpan {
    /// Label in `MM/DD-MM/DD` form, built from the clipped display bounds.
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.display_start.format("%m/%d"),
            self.display_end.format("%m/%d")
        )
    }

    /// Whether a date falls in this calendar week (unclipped span).
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.monday <= date && date <= self.sunday
    }
}

/// The Monday on or before `date`.
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_monday()))
}

/// The first Monday of a calendar year. Fallback lower bound for class
/// histories when the enrollment start date is absent or unparsable.
pub fn first_monday_of_year(year: i32) -> NaiveDate {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).expect("January 1st is a valid date");
    if jan1.weekday() == Weekday::Mon {
        jan1
    } else {
        jan1 + Days::new(u64::from(7 - jan1.weekday().num_days_from_monday()))
    }
}

/// Builds the gap-free sequence of calendar weeks covering
/// `[start, end]` inclusive. Iterates Mondays from the Monday on/before
/// `start` while the Monday is still ≤ `end`; an inverted range yields no
/// weeks.
pub fn week_spans(start: NaiveDate, end: NaiveDate) -> Vec<WeekSpan> {
    let mut spans = Vec::new();
    if start > end {
        return spans;
    }

    let mut monday = monday_of(start);
    while monday <= end {
        let sunday = monday + Days::new(6);
        spans.push(WeekSpan {
            monday,
            sunday,
            display_start: monday.max(start),
            display_end: sunday.min(end),
        });
        monday = monday + Days::new(7);
    }
    spans
}
