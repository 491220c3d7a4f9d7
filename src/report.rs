// src/report.rs
//
// HTTP handlers. The weekly report walks the full chain: bearer credential
// -> identity verification -> role/scope resolution -> parameter validation
// -> filtered fetch -> aggregation. The per-class endpoints authenticate
// only; their data access already went through the store's row policy.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aggregate::{
    assemble_weekly_history, class_attendance_summary, sessions_by_date, week_buckets,
};
use crate::scope::{resolve_access, AdminRole, ScopeGrant};
use crate::status::AttendanceStatus;
use crate::store::{AuthContext, ClassId, RowFilter, SessionEntry, DATE_FORMAT};
use crate::week_range::week_spans;
use crate::{AppError, AppState};

/// Extracts and verifies the bearer credential. A missing or malformed
/// header and a rejected token are both 401; a verifier transport failure
/// is a 500.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, AppError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized)?;
    match state.verifier.verify(token).await? {
        Some(context) => Ok(context),
        None => Err(AppError::Unauthorized),
    }
}

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| AppError::InvalidRange(format!("{} must be a YYYY-MM-DD date", field)))
}

fn required_date(raw: Option<&str>, field: &str) -> Result<NaiveDate, AppError> {
    match raw {
        Some(value) if !value.trim().is_empty() => parse_date(value, field),
        _ => Err(AppError::InvalidRange(format!("{} is required", field))),
    }
}

/// `classId` is either "all" (or absent, same thing) or a numeric id.
fn parse_requested_class(raw: Option<&str>) -> Result<Option<ClassId>, AppError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => value
            .trim()
            .parse::<ClassId>()
            .map(Some)
            .map_err(|_| AppError::InvalidRange("classId must be numeric or 'all'".to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyReportParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub class_id: Option<String>,
}

/// GET /api/reports/weekly-attendance
pub async fn weekly_attendance_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WeeklyReportParams>,
) -> Result<Json<Value>, AppError> {
    let context = authenticate(&state, &headers).await?;
    let role = AdminRole::parse(&context.role)?;
    let grant = ScopeGrant::from_claims(role, context.scope_id.as_deref())?;
    let access = resolve_access(&grant, state.directory.as_ref()).await?;

    let requested = parse_requested_class(params.class_id.as_deref())?;
    access.authorize(requested)?;

    let start = required_date(params.start_date.as_deref(), "startDate")?;
    let end = required_date(params.end_date.as_deref(), "endDate")?;
    if start > end {
        return Err(AppError::InvalidRange(
            "startDate must not be after endDate".to_string(),
        ));
    }
    if let Some(cap) = state.config.report_max_range_days {
        let window_days = (end - start).num_days() + 1;
        if window_days > i64::from(cap) {
            warn!(
                "Rejecting weekly report range of {} days (cap {}) for user {}",
                window_days, cap, context.user_id
            );
            return Err(AppError::InvalidRange(format!(
                "date range must not exceed {} days",
                cap
            )));
        }
    }

    let filter = RowFilter {
        class_ids: access.filter_ids(requested),
        start: Some(start),
        end: Some(end),
    };
    let rows = state.store.fetch_rows(&filter).await?;
    let spans = week_spans(start, end);
    let sessions = sessions_by_date(&rows);
    let buckets = week_buckets(&spans, &sessions);

    info!(
        "Weekly attendance report: user={}, role={}, rows={}, weeks={}",
        context.user_id,
        role.as_str(),
        rows.len(),
        buckets.len()
    );
    Ok(Json(json!({ "data": buckets })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub reference_date: Option<String>,
}

/// GET /api/classes/{class_id}/weekly-history
pub async fn class_weekly_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(class_id): Path<ClassId>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, AppError> {
    authenticate(&state, &headers).await?;

    let reference = match params.reference_date.as_deref() {
        Some(raw) => parse_date(raw, "referenceDate")?,
        None => Local::now().date_naive(),
    };
    let class = state
        .directory
        .find_class(class_id)
        .await?
        .ok_or(AppError::ClassNotFound(class_id))?;

    let filter = RowFilter {
        class_ids: Some(vec![class_id]),
        ..RowFilter::default()
    };
    let rows = state.store.fetch_rows(&filter).await?;
    let history = assemble_weekly_history(class.start_date.as_deref(), reference, &rows);

    info!(
        "Weekly history: class={}, weeks={}, missing={}, holiday={}",
        class_id,
        history.weeks.len(),
        history.missing_weeks.len(),
        history.holiday_weeks.len()
    );
    Ok(Json(json!({ "data": history })))
}

/// GET /api/classes/{class_id}/attendance-summary
pub async fn class_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(class_id): Path<ClassId>,
) -> Result<Json<Value>, AppError> {
    authenticate(&state, &headers).await?;

    state
        .directory
        .find_class(class_id)
        .await?
        .ok_or(AppError::ClassNotFound(class_id))?;

    let filter = RowFilter {
        class_ids: Some(vec![class_id]),
        ..RowFilter::default()
    };
    let rows = state.store.fetch_rows(&filter).await?;
    let summary = class_attendance_summary(&rows);
    Ok(Json(json!({ "data": summary })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSessionRequest {
    pub class_id: ClassId,
    pub date: String,
    pub entries: Vec<SessionEntry>,
}

/// POST /api/attendance/sessions
///
/// Scope-checked write path: the caller must be an admin whose scope covers
/// the class. Status codes are validated up front so a bad batch is
/// rejected whole instead of corrupting the session.
pub async fn save_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveSessionRequest>,
) -> Result<Json<Value>, AppError> {
    let context = authenticate(&state, &headers).await?;
    let role = AdminRole::parse(&context.role)?;
    let grant = ScopeGrant::from_claims(role, context.scope_id.as_deref())?;
    let access = resolve_access(&grant, state.directory.as_ref()).await?;
    access.authorize(Some(body.class_id))?;

    let date = parse_date(&body.date, "date")?;
    for entry in &body.entries {
        AttendanceStatus::from_code(entry.status_code)?;
    }

    state
        .store
        .save_session(body.class_id, date, &body.entries)
        .await?;
    info!(
        "Session saved: user={}, class={}, date={}, entries={}",
        context.user_id,
        body.class_id,
        body.date,
        body.entries.len()
    );
    Ok(Json(json!({ "data": { "saved": body.entries.len() } })))
}
