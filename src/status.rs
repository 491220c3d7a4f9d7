// src/status.rs

use crate::AppError;

/// Semantic attendance status behind the integer wire codes.
///
/// The wire values 0..=4 are fixed; renumbering them requires a data
/// migration, so the mapping lives in exactly one place. Rows carry the
/// integer code on the wire; this enum never serializes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttendanceStatus {
    Absent,
    Present,
    Online,
    Leave,
    Holiday,
}

impl AttendanceStatus {
    /// Decodes a stored status code. A code outside 0..=4 is corrupt data,
    /// not user input; callers on the read path skip the row instead of
    /// failing the whole aggregation.
    pub fn from_code(code: i64) -> Result<Self, AppError> {
        match code {
            0 => Ok(AttendanceStatus::Absent),
            1 => Ok(AttendanceStatus::Present),
            2 => Ok(AttendanceStatus::Online),
            3 => Ok(AttendanceStatus::Leave),
            4 => Ok(AttendanceStatus::Holiday),
            other => Err(AppError::InvalidStatus(other)),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            AttendanceStatus::Absent => 0,
            AttendanceStatus::Present => 1,
            AttendanceStatus::Online => 2,
            AttendanceStatus::Leave => 3,
            AttendanceStatus::Holiday => 4,
        }
    }

    /// Present and online both count as attended.
    pub fn is_attended(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Online)
    }

    pub fn is_holiday(self) -> bool {
        matches!(self, AttendanceStatus::Holiday)
    }
}
