// src/aggregate.rs
//
// The aggregation core: raw attendance rows -> per-session stats -> weekly
// buckets, attendance rates, and the per-class weekly history.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::warn;

use crate::status::AttendanceStatus;
use crate::store::{AttendanceRow, ClassId, DATE_FORMAT};
use crate::week_range::{first_monday_of_year, monday_of, week_spans, WeekSpan};

/// Derived stats for one session (all records of one class on one date).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Records marked present or online. Zero for holiday sessions.
    pub attended: u32,
    /// All valid records in the session, used for data-quality checks only.
    pub total: u32,
    /// True iff every record in the session is holiday-status.
    pub holiday: bool,
}

/// Key is date-first so a week's sessions can be range-scanned.
pub type SessionKey = (NaiveDate, ClassId);

/// Groups rows into sessions keyed by `(date, class)` and classifies each
/// one. Rows with unparsable dates or unknown status codes are corrupt data;
/// they are skipped with a warning so one bad row cannot blank out a report.
pub fn sessions_by_date(rows: &[AttendanceRow]) -> BTreeMap<SessionKey, SessionStats> {
    let mut grouped: BTreeMap<SessionKey, Vec<AttendanceStatus>> = BTreeMap::new();
    for row in rows {
        let date = match NaiveDate::parse_from_str(&row.date, DATE_FORMAT) {
            Ok(date) => date,
            Err(e) => {
                warn!(
                    "Skipping attendance row with unparsable date '{}' (class={}, student={}): {}",
                    row.date, row.class_id, row.student_id, e
                );
                continue;
            }
        };
        let status = match AttendanceStatus::from_code(row.status_code) {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Skipping attendance row with unknown status code {} (class={}, date={})",
                    row.status_code, row.class_id, row.date
                );
                continue;
            }
        };
        grouped.entry((date, row.class_id)).or_default().push(status);
    }

    grouped
        .into_iter()
        .map(|((date, class_id), statuses)| {
            // Groups here are never empty, so all() is safe as the holiday
            // test. A mix of holiday and working records should not occur
            // under the replace-on-save pattern; it is coerced to a working
            // session rather than failing.
            let holiday = statuses.iter().all(|s| s.is_holiday());
            if !holiday && statuses.iter().any(|s| s.is_holiday()) {
                warn!(
                    "Session mixes holiday and working records; treating as working (class={}, date={})",
                    class_id, date
                );
            }
            let attended = if holiday {
                0
            } else {
                statuses.iter().filter(|s| s.is_attended()).count() as u32
            };
            (
                (date, class_id),
                SessionStats {
                    attended,
                    total: statuses.len() as u32,
                    holiday,
                },
            )
        })
        .collect()
}

/// One calendar week's aggregated attendance, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekBucket {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub label: String,
    pub attendance_count: u32,
    pub is_missing: bool,
    pub is_holiday: bool,
    pub holiday_count: u32,
}

/// Folds classified sessions into one bucket per week span. Sessions are
/// matched on the unclipped Monday–Sunday span; holiday sessions count
/// toward `holiday_count` only and are excluded from `attendance_count`.
pub fn week_buckets(
    spans: &[WeekSpan],
    sessions: &BTreeMap<SessionKey, SessionStats>,
) -> Vec<WeekBucket> {
    spans
        .iter()
        .map(|span| {
            let mut attendance_count = 0u32;
            let mut holiday_count = 0u32;
            let mut session_count = 0u32;
            for (_, stats) in
                sessions.range((span.monday, ClassId::MIN)..=(span.sunday, ClassId::MAX))
            {
                session_count += 1;
                if stats.holiday {
                    holiday_count += 1;
                } else {
                    attendance_count += stats.attended;
                }
            }
            WeekBucket {
                week_start: span.display_start,
                week_end: span.display_end,
                label: span.label(),
                attendance_count,
                is_missing: session_count == 0,
                is_holiday: holiday_count > 0 && attendance_count == 0,
                holiday_count,
            }
        })
        .collect()
}

/// All-time attendance rate: rounded percentage of non-holiday records
/// marked present or online. Always in 0..=100; a record set that is empty
/// or all-holiday rates 0.
pub fn attendance_rate(rows: &[AttendanceRow]) -> u32 {
    let mut attended = 0u32;
    let mut non_holiday = 0u32;
    for row in rows {
        let status = match AttendanceStatus::from_code(row.status_code) {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Skipping row with unknown status code {} in rate calculation (class={}, date={})",
                    row.status_code, row.class_id, row.date
                );
                continue;
            }
        };
        if status.is_holiday() {
            continue;
        }
        non_holiday += 1;
        if status.is_attended() {
            attended += 1;
        }
    }
    ((f64::from(attended) * 100.0) / f64::from(non_holiday.max(1))).round() as u32
}

/// The most recent date string present in the rows. Lexicographic max is
/// correct for `YYYY-MM-DD`.
fn latest_date(rows: &[AttendanceRow]) -> Option<&str> {
    rows.iter().map(|row| row.date.as_str()).max()
}

/// Attendance rate of the most recent session only.
pub fn latest_session_rate(rows: &[AttendanceRow]) -> u32 {
    let Some(latest) = latest_date(rows) else {
        return 0;
    };
    let latest_rows: Vec<AttendanceRow> = rows
        .iter()
        .filter(|row| row.date == latest)
        .cloned()
        .collect();
    attendance_rate(&latest_rows)
}

/// Latest-session metadata plus the all-time rate for one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAttendanceSummary {
    pub learning_progress: Option<String>,
    pub page: Option<i64>,
    pub line: Option<i64>,
    pub attendance_rate: u32,
    pub latest_date: String,
}

/// Summarizes one class from its full row history; `None` when the class
/// has no rows at all.
pub fn class_attendance_summary(rows: &[AttendanceRow]) -> Option<ClassAttendanceSummary> {
    let latest = latest_date(rows)?.to_string();
    // Prefer a row that actually carries progress metadata; the save form
    // fills it on one entry per session at most.
    let latest_row = rows
        .iter()
        .filter(|row| row.date == latest)
        .find(|row| row.learning_progress.is_some())
        .or_else(|| rows.iter().find(|row| row.date == latest))?;
    Some(ClassAttendanceSummary {
        learning_progress: latest_row.learning_progress.clone(),
        page: latest_row.page,
        line: latest_row.line,
        attendance_rate: attendance_rate(rows),
        latest_date: latest,
    })
}

/// Weekly history of one class: a bucket per calendar week plus the derived
/// alert lists the caller renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyHistory {
    pub weeks: Vec<WeekBucket>,
    pub missing_weeks: Vec<String>,
    pub holiday_weeks: Vec<String>,
}

/// Lower bound of a class history: the class's enrollment start date, or
/// the first Monday of the reference date's year when absent/unparsable.
/// The fallback is clamped to the reference's own week so an early-January
/// reference (before that year's first Monday) still yields its week.
pub fn history_lower_bound(class_start: Option<&str>, reference: NaiveDate) -> NaiveDate {
    let fallback = || first_monday_of_year(reference.year()).min(monday_of(reference));
    match class_start {
        Some(raw) => match NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT) {
            Ok(start) => start,
            Err(e) => {
                warn!(
                    "Class start date '{}' is unparsable, falling back to start of year: {}",
                    raw, e
                );
                fallback()
            }
        },
        None => fallback(),
    }
}

/// Assembles the weekly history for one class. The range runs from the
/// class's enrollment week through the week containing `reference`
/// (normally today; injectable for tests), one bucket per calendar week,
/// empty weeks included. Sessions outside the range are ignored.
pub fn assemble_weekly_history(
    class_start: Option<&str>,
    reference: NaiveDate,
    rows: &[AttendanceRow],
) -> WeeklyHistory {
    let lower = history_lower_bound(class_start, reference);
    let spans = week_spans(lower, reference);
    debug_assert!(
        spans.last().map_or(true, |s| s.contains(reference)),
        "last span must cover the reference date"
    );
    let sessions = sessions_by_date(rows);
    let weeks = week_buckets(&spans, &sessions);
    let missing_weeks = weeks
        .iter()
        .filter(|w| w.is_missing)
        .map(|w| w.label.clone())
        .collect();
    let holiday_weeks = weeks
        .iter()
        .filter(|w| w.is_holiday)
        .map(|w| w.label.clone())
        .collect();
    WeeklyHistory {
        weeks,
        missing_weeks,
        holiday_weeks,
    }
}
