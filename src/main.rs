// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregate;
mod remote;
mod report;
mod scope;
mod status;
mod store;
mod week_range;

mod report_tests;

// --- Error Handling ---

/// Request-level error taxonomy, mapped onto the API's HTTP contract.
/// Authorization and validation failures carry a machine-readable code;
/// collaborator failures are logged and surfaced as a bare 500.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("missing or invalid bearer credential")]
    Unauthorized,
    #[error("role '{0}' may not access attendance data")]
    ForbiddenRole(String),
    #[error("role requires a scope but none was granted")]
    MissingScope,
    #[error("requested class is outside the granted scope")]
    ScopeViolation,
    #[error("invalid request parameters: {0}")]
    InvalidRange(String),
    #[error("invalid attendance status code: {0}")]
    InvalidStatus(i64),
    #[error("class {0} not found")]
    ClassNotFound(i64),
    #[error("collaborator lookup failed: {0}")]
    LookupFailure(#[from] anyhow::Error),
}

impl AppError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::ForbiddenRole(_) => "forbidden_role",
            AppError::MissingScope => "missing_scope",
            AppError::ScopeViolation => "scope_violation",
            AppError::InvalidRange(_) => "invalid_range",
            AppError::InvalidStatus(_) => "invalid_status",
            AppError::ClassNotFound(_) => "class_not_found",
            AppError::LookupFailure(_) => "lookup_failure",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::ForbiddenRole(_) | AppError::MissingScope | AppError::ScopeViolation => {
                StatusCode::FORBIDDEN
            }
            AppError::InvalidRange(_) | AppError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            AppError::ClassNotFound(_) => StatusCode::NOT_FOUND,
            AppError::LookupFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {:#}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.error_code() }))).into_response()
    }
}

// --- Configuration ---

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub identity_base_url: String,
    pub records_base_url: String,
    /// Optional cap on the weekly-report window, in days. Unset preserves
    /// the original unbounded contract.
    #[serde(default)]
    pub report_max_range_days: Option<u32>,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3000
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        // Load .env file if it exists
        dotenv::dotenv().ok();
        envy::from_env::<Config>()
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "attendance-core",
    about = "Attendance aggregation and access-scoping backend"
)]
struct Cli {
    /// Override SERVER_HOST from the environment
    #[arg(long)]
    host: Option<String>,
    /// Override SERVER_PORT from the environment
    #[arg(long)]
    port: Option<u16>,
}

// --- Shared Application State ---

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<dyn store::TokenVerifier>,
    pub directory: Arc<dyn store::ClassDirectory>,
    pub store: Arc<dyn store::AttendanceStore>,
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/reports/weekly-attendance",
            get(report::weekly_attendance_report),
        )
        .route(
            "/api/classes/{class_id}/weekly-history",
            get(report::class_weekly_history),
        )
        .route(
            "/api/classes/{class_id}/attendance-summary",
            get(report::class_summary),
        )
        .route("/api/attendance/sessions", post(report::save_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration from environment")?;
    if let Some(host) = cli.host {
        config.server_host = host;
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting attendance-core");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    let identity = remote::IdentityClient::new(http_client.clone(), &config.identity_base_url)?;
    let records = Arc::new(remote::RecordsClient::new(
        http_client,
        &config.records_base_url,
    )?);

    let state = AppState {
        config: Arc::new(config.clone()),
        verifier: Arc::new(identity),
        directory: records.clone(),
        store: records,
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app(state)).await?;

    Ok(())
}
