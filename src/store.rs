// src/store.rs
//
// Domain row types and the seams to the three external collaborators:
// the identity service (token verification), the class directory, and the
// attendance record store. The in-memory implementations double as local
// wiring and as test fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result as AnyhowResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

pub type ClassId = i64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One stored attendance record. At most one exists per
/// `(class_id, student_id, date)`; the session-save path enforces that with
/// a replace keyed on class + date.
///
/// The date stays a `YYYY-MM-DD` string until aggregation parses it, so one
/// malformed row can be skipped instead of sinking a whole report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRow {
    pub class_id: ClassId,
    pub student_id: String,
    pub date: String,
    pub status_code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
}

/// One student's entry in a session-save batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub student_id: String,
    pub status_code: i64,
    #[serde(default)]
    pub learning_progress: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub line: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    pub id: ClassId,
    pub name: String,
    /// Enrollment start, `YYYY-MM-DD`. May be unset or unparsable for
    /// legacy classes; the history assembler falls back to the first
    /// Monday of the current year.
    #[serde(default)]
    pub start_date: Option<String>,
}

/// Filter for a raw-row fetch. `class_ids: None` means unfiltered (only the
/// super-admin path uses that).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub class_ids: Option<Vec<ClassId>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Verified identity claims, parsed once at the authorization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub role: String,
    #[serde(default)]
    pub scope_id: Option<String>,
}

// --- Collaborator traits ---

/// Identity-service seam. `Ok(None)` is a well-formed "token rejected"
/// answer (401 upstream); `Err` is the service being unreachable or broken.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> AnyhowResult<Option<AuthContext>>;
}

/// Class-lookup seam used by scope resolution and the class endpoints.
#[async_trait]
pub trait ClassDirectory: Send + Sync {
    async fn class_ids_by_main_branch(&self, main_branch_id: &str) -> AnyhowResult<Vec<ClassId>>;
    async fn class_ids_by_sub_branch(&self, sub_branch_id: &str) -> AnyhowResult<Vec<ClassId>>;
    async fn class_ids_by_classroom(&self, classroom_id: &str) -> AnyhowResult<Vec<ClassId>>;
    async fn find_class(&self, class_id: ClassId) -> AnyhowResult<Option<ClassRecord>>;
}

/// Attendance record store seam.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn fetch_rows(&self, filter: &RowFilter) -> AnyhowResult<Vec<AttendanceRow>>;

    /// Replaces the whole session for `(class_id, date)` with `entries`.
    /// Implementations must serialize concurrent saves to the same session;
    /// interleaved delete/insert pairs can otherwise drop one writer's rows.
    async fn save_session(
        &self,
        class_id: ClassId,
        date: NaiveDate,
        entries: &[SessionEntry],
    ) -> AnyhowResult<()>;
}

// --- In-memory implementations ---

/// A class plus its position in the org tree, for the in-memory directory.
#[derive(Debug, Clone, PartialEq)]
pub struct OrgClass {
    pub record: ClassRecord,
    pub main_branch_id: String,
    pub sub_branch_id: String,
    pub classroom_id: String,
}

#[derive(Clone, Default)]
pub struct MemoryDirectory {
    classes: Arc<Mutex<Vec<OrgClass>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_class(&self, class: OrgClass) {
        self.classes.lock().await.push(class);
    }

    async fn ids_matching(&self, pred: impl Fn(&OrgClass) -> bool) -> Vec<ClassId> {
        self.classes
            .lock()
            .await
            .iter()
            .filter(|c| pred(c))
            .map(|c| c.record.id)
            .collect()
    }
}

#[async_trait]
impl ClassDirectory for MemoryDirectory {
    async fn class_ids_by_main_branch(&self, main_branch_id: &str) -> AnyhowResult<Vec<ClassId>> {
        Ok(self.ids_matching(|c| c.main_branch_id == main_branch_id).await)
    }

    async fn class_ids_by_sub_branch(&self, sub_branch_id: &str) -> AnyhowResult<Vec<ClassId>> {
        Ok(self.ids_matching(|c| c.sub_branch_id == sub_branch_id).await)
    }

    async fn class_ids_by_classroom(&self, classroom_id: &str) -> AnyhowResult<Vec<ClassId>> {
        Ok(self.ids_matching(|c| c.classroom_id == classroom_id).await)
    }

    async fn find_class(&self, class_id: ClassId) -> AnyhowResult<Option<ClassRecord>> {
        Ok(self
            .classes
            .lock()
            .await
            .iter()
            .find(|c| c.record.id == class_id)
            .map(|c| c.record.clone()))
    }
}

type SessionKey = (ClassId, NaiveDate);

#[derive(Clone, Default)]
pub struct MemoryAttendanceStore {
    rows: Arc<Mutex<Vec<AttendanceRow>>>,
    session_locks: Arc<Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds rows directly, bypassing the session-save path. Intended for
    /// fixtures; deliberately allows the malformed rows aggregation must
    /// tolerate.
    pub async fn seed_rows(&self, rows: Vec<AttendanceRow>) {
        self.rows.lock().await.extend(rows);
    }

    async fn session_lock(&self, key: SessionKey) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops a session's lock entry once no save holds it, so the lock map
    /// does not grow with every session ever written.
    async fn prune_session_lock(&self, key: SessionKey) {
        let mut locks = self.session_locks.lock().await;
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    pub async fn session_lock_count(&self) -> usize {
        self.session_locks.lock().await.len()
    }
}

#[async_trait]
impl AttendanceStore for MemoryAttendanceStore {
    async fn fetch_rows(&self, filter: &RowFilter) -> AnyhowResult<Vec<AttendanceRow>> {
        // ISO date strings compare correctly lexicographically, so the range
        // filter works on the raw strings; malformed dates fall out later
        // during aggregation.
        let start = filter.start.map(|d| d.format(DATE_FORMAT).to_string());
        let end = filter.end.map(|d| d.format(DATE_FORMAT).to_string());

        let rows = self.rows.lock().await;
        let selected: Vec<AttendanceRow> = rows
            .iter()
            .filter(|row| match &filter.class_ids {
                Some(ids) => ids.contains(&row.class_id),
                None => true,
            })
            .filter(|row| start.as_deref().map_or(true, |s| row.date.as_str() >= s))
            .filter(|row| end.as_deref().map_or(true, |e| row.date.as_str() <= e))
            .cloned()
            .collect();
        debug!("Fetched {} of {} stored attendance rows", selected.len(), rows.len());
        Ok(selected)
    }

    async fn save_session(
        &self,
        class_id: ClassId,
        date: NaiveDate,
        entries: &[SessionEntry],
    ) -> AnyhowResult<()> {
        // Two-step replace. The per-session lock keeps concurrent saves to
        // the same (class, date) strictly serial; saves to other sessions
        // are unaffected.
        let key = (class_id, date);
        let lock = self.session_lock(key).await;
        let guard = lock.lock().await;

        let date_str = date.format(DATE_FORMAT).to_string();
        {
            let mut rows = self.rows.lock().await;
            rows.retain(|row| !(row.class_id == class_id && row.date == date_str));
            for entry in entries {
                rows.push(AttendanceRow {
                    class_id,
                    student_id: entry.student_id.clone(),
                    date: date_str.clone(),
                    status_code: entry.status_code,
                    learning_progress: entry.learning_progress.clone(),
                    page: entry.page,
                    line: entry.line,
                });
            }
        }
        debug!(
            "Saved session: class={}, date={}, entries={}",
            class_id,
            date_str,
            entries.len()
        );

        drop(guard);
        drop(lock);
        self.prune_session_lock(key).await;
        Ok(())
    }
}

/// Fixed-token verifier for local wiring and tests; the production binary
/// wires the identity-service client from `remote` instead.
#[derive(Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthContext>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, context: AuthContext) -> Self {
        self.tokens.insert(token.to_string(), context);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> AnyhowResult<Option<AuthContext>> {
        Ok(self.tokens.get(token).cloned())
    }
}
