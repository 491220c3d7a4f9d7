// src/report_tests.rs

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::remote::RecordsClient;
    use crate::store::{
        AttendanceRow, AttendanceStore, AuthContext, ClassRecord, MemoryAttendanceStore,
        MemoryDirectory, OrgClass, RowFilter, SessionEntry, StaticTokenVerifier,
    };
    use crate::{app, AppState, Config};

    fn test_config(report_max_range_days: Option<u32>) -> Config {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            identity_base_url: "http://identity.test".to_string(),
            records_base_url: "http://records.test".to_string(),
            report_max_range_days,
        }
    }

    fn row(class_id: i64, student_id: &str, date: &str, status_code: i64) -> AttendanceRow {
        AttendanceRow {
            class_id,
            student_id: student_id.to_string(),
            date: date.to_string(),
            status_code,
            learning_progress: None,
            page: None,
            line: None,
        }
    }

    struct TestEnv {
        state: AppState,
        store: Arc<MemoryAttendanceStore>,
    }

    /// Two sub-branches under one main branch: class 1 in sub-branch 42,
    /// class 99 in sub-branch 7. Tokens for each interesting caller.
    async fn env(report_max_range_days: Option<u32>) -> TestEnv {
        let directory = Arc::new(MemoryDirectory::new());
        directory
            .add_class(OrgClass {
                record: ClassRecord {
                    id: 1,
                    name: "Morning A".to_string(),
                    start_date: Some("2024-01-08".to_string()),
                },
                main_branch_id: "mb1".to_string(),
                sub_branch_id: "42".to_string(),
                classroom_id: "cr1".to_string(),
            })
            .await;
        directory
            .add_class(OrgClass {
                record: ClassRecord {
                    id: 99,
                    name: "Evening B".to_string(),
                    start_date: None,
                },
                main_branch_id: "mb1".to_string(),
                sub_branch_id: "7".to_string(),
                classroom_id: "cr2".to_string(),
            })
            .await;

        let verifier = StaticTokenVerifier::new()
            .with_token(
                "super-token",
                AuthContext {
                    user_id: "u-super".to_string(),
                    role: "super_admin".to_string(),
                    scope_id: None,
                },
            )
            .with_token(
                "branch-token",
                AuthContext {
                    user_id: "u-branch".to_string(),
                    role: "branch_admin".to_string(),
                    scope_id: Some("42".to_string()),
                },
            )
            .with_token(
                "branch-unscoped-token",
                AuthContext {
                    user_id: "u-unscoped".to_string(),
                    role: "branch_admin".to_string(),
                    scope_id: None,
                },
            )
            .with_token(
                "classroom-empty-token",
                AuthContext {
                    user_id: "u-empty".to_string(),
                    role: "classroom_admin".to_string(),
                    scope_id: Some("nowhere".to_string()),
                },
            )
            .with_token(
                "class-token",
                AuthContext {
                    user_id: "u-class".to_string(),
                    role: "class_admin".to_string(),
                    scope_id: Some("1".to_string()),
                },
            )
            .with_token(
                "parent-token",
                AuthContext {
                    user_id: "u-parent".to_string(),
                    role: "parent".to_string(),
                    scope_id: None,
                },
            );

        let store = Arc::new(MemoryAttendanceStore::new());
        let state = AppState {
            config: Arc::new(test_config(report_max_range_days)),
            verifier: Arc::new(verifier),
            directory,
            store: store.clone(),
        };
        TestEnv { state, store }
    }

    /// Shared fixture: class 1 meets 2024-01-10 (2 present, 1 absent)
    /// and 2024-01-22 (all three marked holiday).
    async fn seed_scenario(store: &MemoryAttendanceStore) {
        store
            .seed_rows(vec![
                row(1, "s1", "2024-01-10", 1),
                row(1, "s2", "2024-01-10", 1),
                row(1, "s3", "2024-01-10", 0),
                row(1, "s1", "2024-01-22", 4),
                row(1, "s2", "2024-01-22", 4),
                row(1, "s3", "2024-01-22", 4),
            ])
            .await;
    }

    async fn get(state: &AppState, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder.body(Body::empty()).expect("valid request");
        send(state, request).await
    }

    async fn post_json(
        state: &AppState,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder
            .body(Body::from(serde_json::to_vec(&body).expect("serializable")))
            .expect("valid request");
        send(state, request).await
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(state.clone())
            .oneshot(request)
            .await
            .expect("infallible app service");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("readable body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    const REPORT_URI: &str =
        "/api/reports/weekly-attendance?startDate=2024-01-08&endDate=2024-02-04";

    // --- Authentication & authorization ---

    #[tokio::test]
    async fn report_without_credential_is_401() {
        let env = env(None).await;
        let (status, body) = get(&env.state, REPORT_URI, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn report_with_unknown_token_is_401() {
        let env = env(None).await;
        let (status, body) = get(&env.state, REPORT_URI, Some("bogus")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn report_with_non_admin_role_is_403() {
        let env = env(None).await;
        let (status, body) = get(&env.state, REPORT_URI, Some("parent-token")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden_role");
    }

    #[tokio::test]
    async fn scoped_role_without_scope_is_403() {
        let env = env(None).await;
        let (status, body) = get(&env.state, REPORT_URI, Some("branch-unscoped-token")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "missing_scope");
    }

    #[tokio::test]
    async fn requesting_a_class_in_another_sub_branch_is_403() {
        let env = env(None).await;
        let uri = format!("{}&classId=99", REPORT_URI);
        let (status, body) = get(&env.state, &uri, Some("branch-token")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "scope_violation");
    }

    // --- Parameter validation ---

    #[tokio::test]
    async fn missing_dates_are_400() {
        let env = env(None).await;
        let (status, body) = get(
            &env.state,
            "/api/reports/weekly-attendance?classId=all",
            Some("super-token"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_range");
    }

    #[tokio::test]
    async fn inverted_range_is_400() {
        let env = env(None).await;
        let (status, body) = get(
            &env.state,
            "/api/reports/weekly-attendance?startDate=2024-02-04&endDate=2024-01-08",
            Some("super-token"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_range");
    }

    #[tokio::test]
    async fn range_wider_than_the_configured_cap_is_400() {
        let env = env(Some(14)).await;
        let (status, body) = get(&env.state, REPORT_URI, Some("super-token")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_range");

        // Within the cap the same request goes through.
        let (status, _) = get(
            &env.state,
            "/api/reports/weekly-attendance?startDate=2024-01-08&endDate=2024-01-21",
            Some("super-token"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // --- Report aggregation ---

    #[tokio::test]
    async fn weekly_report_buckets_match_the_scenario() {
        let env = env(None).await;
        seed_scenario(&env.store).await;

        let (status, body) = get(&env.state, REPORT_URI, Some("super-token")).await;
        assert_eq!(status, StatusCode::OK);
        let weeks = body["data"].as_array().expect("data array");
        assert_eq!(weeks.len(), 4);

        assert_eq!(weeks[0]["attendanceCount"], 2);
        assert_eq!(weeks[0]["isMissing"], false);
        assert_eq!(weeks[0]["isHoliday"], false);
        assert_eq!(weeks[0]["label"], "01/08-01/14");

        assert_eq!(weeks[1]["isMissing"], true);
        assert_eq!(weeks[1]["attendanceCount"], 0);

        assert_eq!(weeks[2]["isHoliday"], true);
        assert_eq!(weeks[2]["isMissing"], false);
        assert_eq!(weeks[2]["attendanceCount"], 0);
        assert_eq!(weeks[2]["holidayCount"], 1);

        assert_eq!(weeks[3]["isMissing"], true);
    }

    #[tokio::test]
    async fn branch_admin_report_only_sees_its_own_classes() {
        let env = env(None).await;
        seed_scenario(&env.store).await;
        // A class-99 session in the first week must not leak into the
        // branch-42 admin's numbers.
        env.store
            .seed_rows(vec![row(99, "x1", "2024-01-10", 1)])
            .await;

        let (status, body) = get(&env.state, REPORT_URI, Some("branch-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["attendanceCount"], 2);

        let (_, super_body) = get(&env.state, REPORT_URI, Some("super-token")).await;
        assert_eq!(super_body["data"][0]["attendanceCount"], 3);
    }

    #[tokio::test]
    async fn empty_scope_yields_an_empty_report_not_an_error() {
        let env = env(None).await;
        seed_scenario(&env.store).await;

        let (status, body) = get(&env.state, REPORT_URI, Some("classroom-empty-token")).await;
        assert_eq!(status, StatusCode::OK);
        let weeks = body["data"].as_array().expect("data array");
        assert_eq!(weeks.len(), 4);
        assert!(weeks.iter().all(|w| w["isMissing"] == true));
    }

    #[tokio::test]
    async fn remote_fetch_with_empty_class_filter_never_contacts_the_store() {
        // Unroutable base URL: any request that actually went out would
        // fail. An empty id set must be answered locally with no rows, not
        // sent as an ambiguous empty classIds parameter.
        let client = RecordsClient::new(reqwest::Client::new(), "http://127.0.0.1:1/")
            .expect("valid URL");
        let filter = RowFilter {
            class_ids: Some(Vec::new()),
            ..RowFilter::default()
        };
        let rows = client.fetch_rows(&filter).await.expect("answered locally");
        assert!(rows.is_empty());
    }

    // --- Class history & summary endpoints ---

    #[tokio::test]
    async fn class_history_matches_the_scenario() {
        let env = env(None).await;
        seed_scenario(&env.store).await;

        let (status, body) = get(
            &env.state,
            "/api/classes/1/weekly-history?referenceDate=2024-01-29",
            Some("class-token"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let history = &body["data"];
        assert_eq!(history["weeks"].as_array().expect("weeks").len(), 4);
        assert_eq!(history["missingWeeks"].as_array().expect("missing").len(), 2);
        assert_eq!(history["holidayWeeks"], json!(["01/22-01/28"]));
    }

    #[tokio::test]
    async fn class_history_for_unknown_class_is_404() {
        let env = env(None).await;
        let (status, body) = get(
            &env.state,
            "/api/classes/555/weekly-history?referenceDate=2024-01-29",
            Some("super-token"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "class_not_found");
    }

    #[tokio::test]
    async fn class_summary_reports_latest_session_and_all_time_rate() {
        let env = env(None).await;
        seed_scenario(&env.store).await;

        let (status, body) = get(
            &env.state,
            "/api/classes/1/attendance-summary",
            Some("class-token"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let summary = &body["data"];
        assert_eq!(summary["latestDate"], "2024-01-22");
        // 2 attended of 3 non-holiday records across the history.
        assert_eq!(summary["attendanceRate"], 67);
    }

    #[tokio::test]
    async fn class_summary_without_rows_is_null() {
        let env = env(None).await;
        let (status, body) = get(
            &env.state,
            "/api/classes/1/attendance-summary",
            Some("class-token"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], Value::Null);
    }

    // --- Session save ---

    #[tokio::test]
    async fn save_session_replaces_the_previous_batch() {
        let env = env(None).await;
        let uri = "/api/attendance/sessions";

        let first = json!({
            "classId": 1,
            "date": "2024-01-10",
            "entries": [
                { "studentId": "s1", "statusCode": 1 },
                { "studentId": "s2", "statusCode": 0 },
                { "studentId": "s3", "statusCode": 1 },
            ],
        });
        let (status, body) = post_json(&env.state, uri, Some("class-token"), first).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["saved"], 3);

        // Saving again for the same session replaces, never appends.
        let second = json!({
            "classId": 1,
            "date": "2024-01-10",
            "entries": [
                { "studentId": "s1", "statusCode": 2 },
                { "studentId": "s2", "statusCode": 1 },
            ],
        });
        let (status, _) = post_json(&env.state, uri, Some("class-token"), second).await;
        assert_eq!(status, StatusCode::OK);

        let rows = env
            .store
            .fetch_rows(&Default::default())
            .await
            .expect("fetch");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.date == "2024-01-10"));
        assert!(rows
            .iter()
            .any(|r| r.student_id == "s1" && r.status_code == 2));
    }

    #[tokio::test]
    async fn save_session_rejects_invalid_status_codes() {
        let env = env(None).await;
        let body = json!({
            "classId": 1,
            "date": "2024-01-10",
            "entries": [{ "studentId": "s1", "statusCode": 9 }],
        });
        let (status, body) =
            post_json(&env.state, "/api/attendance/sessions", Some("class-token"), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_status");

        let rows = env
            .store
            .fetch_rows(&Default::default())
            .await
            .expect("fetch");
        assert!(rows.is_empty(), "rejected batch must not be stored");
    }

    #[tokio::test]
    async fn save_session_outside_scope_is_403() {
        let env = env(None).await;
        let body = json!({
            "classId": 99,
            "date": "2024-01-10",
            "entries": [{ "studentId": "s1", "statusCode": 1 }],
        });
        let (status, body) =
            post_json(&env.state, "/api/attendance/sessions", Some("class-token"), body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "scope_violation");
    }

    #[tokio::test]
    async fn concurrent_saves_to_one_session_do_not_interleave() {
        let store = MemoryAttendanceStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date");

        let batch_a: Vec<SessionEntry> = (0..20)
            .map(|i| SessionEntry {
                student_id: format!("a{}", i),
                status_code: 1,
                learning_progress: None,
                page: None,
                line: None,
            })
            .collect();
        let batch_b: Vec<SessionEntry> = (0..30)
            .map(|i| SessionEntry {
                student_id: format!("b{}", i),
                status_code: 0,
                learning_progress: None,
                page: None,
                line: None,
            })
            .collect();

        let store_a = store.clone();
        let entries_a = batch_a.clone();
        let writer_a =
            tokio::spawn(async move { store_a.save_session(1, date, &entries_a).await });
        let store_b = store.clone();
        let entries_b = batch_b.clone();
        let writer_b =
            tokio::spawn(async move { store_b.save_session(1, date, &entries_b).await });
        writer_a.await.expect("join").expect("save");
        writer_b.await.expect("join").expect("save");

        // Whichever writer landed last, the session must be exactly one
        // complete batch, never a mix of the two.
        let rows = store.fetch_rows(&Default::default()).await.expect("fetch");
        let all_a = rows.len() == 20 && rows.iter().all(|r| r.student_id.starts_with('a'));
        let all_b = rows.len() == 30 && rows.iter().all(|r| r.student_id.starts_with('b'));
        assert!(all_a || all_b, "session mixed rows from both writers");

        // Once no save is in flight the lock map is pruned back to empty.
        assert_eq!(store.session_lock_count().await, 0);
    }
}
