// src/remote.rs
//
// reqwest-backed implementations of the collaborator seams: the identity
// service (token verification) and the record-store API (class directory +
// attendance rows). One shared `reqwest::Client` is passed in from main.

use anyhow::{anyhow, Context, Result as AnyhowResult};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::store::{
    AttendanceRow, AttendanceStore, AuthContext, ClassDirectory, ClassId, ClassRecord, RowFilter,
    SessionEntry, TokenVerifier, DATE_FORMAT,
};

// --- Identity service ---

#[derive(Clone)]
pub struct IdentityClient {
    http: Client,
    verify_url: Url,
}

impl IdentityClient {
    pub fn new(http: Client, base_url: &str) -> AnyhowResult<Self> {
        let base = Url::parse(base_url).context("invalid identity service base URL")?;
        let verify_url = base
            .join("auth/verify")
            .context("building identity verify URL")?;
        Ok(Self { http, verify_url })
    }
}

#[async_trait]
impl TokenVerifier for IdentityClient {
    async fn verify(&self, token: &str) -> AnyhowResult<Option<AuthContext>> {
        let response = self
            .http
            .get(self.verify_url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .context("identity service unreachable")?;

        match response.status() {
            StatusCode::OK => {
                let context: AuthContext = response
                    .json()
                    .await
                    .context("malformed identity service response")?;
                debug!("Token verified: user={}, role={}", context.user_id, context.role);
                Ok(Some(context))
            }
            // The identity service answers 401/403 for tokens it rejects;
            // that is a definitive "no", not a lookup failure.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status => {
                let body = response.text().await.ok();
                error!(
                    "Identity service returned unexpected status {}: {:?}",
                    status, body
                );
                Err(anyhow!("identity service returned status {}", status))
            }
        }
    }
}

// --- Record store ---

#[derive(Clone)]
pub struct RecordsClient {
    http: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

impl RecordsClient {
    pub fn new(http: Client, base_url: &str) -> AnyhowResult<Self> {
        let base_url = Url::parse(base_url).context("invalid record store base URL")?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> AnyhowResult<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("building record store URL for '{}'", path))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> AnyhowResult<T> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .context("record store unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok();
            error!("Record store GET {} failed: {} {:?}", url, status, body);
            return Err(anyhow!("record store returned status {}", status));
        }
        response
            .json::<DataEnvelope<T>>()
            .await
            .map(|envelope| envelope.data)
            .context("malformed record store response")
    }

    async fn class_ids(&self, filter_param: &str, id: &str) -> AnyhowResult<Vec<ClassId>> {
        let mut url = self.endpoint("classes")?;
        url.query_pairs_mut().append_pair(filter_param, id);
        let classes: Vec<ClassRecord> = self.get_json(url).await?;
        Ok(classes.into_iter().map(|c| c.id).collect())
    }
}

#[async_trait]
impl ClassDirectory for RecordsClient {
    async fn class_ids_by_main_branch(&self, main_branch_id: &str) -> AnyhowResult<Vec<ClassId>> {
        self.class_ids("mainBranchId", main_branch_id).await
    }

    async fn class_ids_by_sub_branch(&self, sub_branch_id: &str) -> AnyhowResult<Vec<ClassId>> {
        self.class_ids("subBranchId", sub_branch_id).await
    }

    async fn class_ids_by_classroom(&self, classroom_id: &str) -> AnyhowResult<Vec<ClassId>> {
        self.class_ids("classroomId", classroom_id).await
    }

    async fn find_class(&self, class_id: ClassId) -> AnyhowResult<Option<ClassRecord>> {
        let url = self.endpoint(&format!("classes/{}", class_id))?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .context("record store unreachable")?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let envelope: DataEnvelope<ClassRecord> = response
                    .json()
                    .await
                    .context("malformed record store response")?;
                Ok(Some(envelope.data))
            }
            status => {
                let body = response.text().await.ok();
                error!("Record store GET {} failed: {} {:?}", url, status, body);
                Err(anyhow!("record store returned status {}", status))
            }
        }
    }
}

/// Wire form of a session-save batch, matching the record store's
/// replace-by-(class, date) upsert endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveSessionBody<'a> {
    class_id: ClassId,
    date: String,
    entries: &'a [SessionEntry],
}

#[async_trait]
impl AttendanceStore for RecordsClient {
    async fn fetch_rows(&self, filter: &RowFilter) -> AnyhowResult<Vec<AttendanceRow>> {
        // An empty id set means the caller has no accessible classes. Answer
        // locally: an empty `classIds=` parameter is ambiguous on the wire
        // and a store that reads it as "unfiltered" would leak every row.
        if matches!(&filter.class_ids, Some(ids) if ids.is_empty()) {
            debug!("Empty class-id filter, skipping record store fetch");
            return Ok(Vec::new());
        }
        let mut url = self.endpoint("attendance-records")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(ids) = &filter.class_ids {
                let joined = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                query.append_pair("classIds", &joined);
            }
            if let Some(start) = filter.start {
                query.append_pair("startDate", &start.format(DATE_FORMAT).to_string());
            }
            if let Some(end) = filter.end {
                query.append_pair("endDate", &end.format(DATE_FORMAT).to_string());
            }
        }
        let rows: Vec<AttendanceRow> = self.get_json(url).await?;
        debug!("Fetched {} attendance rows from record store", rows.len());
        Ok(rows)
    }

    async fn save_session(
        &self,
        class_id: ClassId,
        date: NaiveDate,
        entries: &[SessionEntry],
    ) -> AnyhowResult<()> {
        // The record store's session endpoint replaces the whole
        // (class, date) batch in one transactional upsert, which is what
        // makes concurrent saves safe on this path.
        let url = self.endpoint("attendance-sessions")?;
        let body = SaveSessionBody {
            class_id,
            date: date.format(DATE_FORMAT).to_string(),
            entries,
        };
        let response = self
            .http
            .put(url.clone())
            .json(&body)
            .send()
            .await
            .context("record store unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.ok();
            error!("Record store PUT {} failed: {} {:?}", url, status, detail);
            return Err(anyhow!(
                "record store rejected session save with status {}: {}",
                status,
                detail.unwrap_or_default()
            ));
        }
        Ok(())
    }
}
