// 🌐 REST API with Axum
//
// Thin layer: authenticate, parse, call the service, serialize.
// Every failure leaves as a structured JSON error with one fixed status.

use crate::auth::{parse_authorization, AuthService};
use crate::config::Config;
use crate::db::Event;
use crate::entities::{
    Account, ApplicantSummary, Capability, FlagReason, FraudFlag, LoanApplication, LoanFilter, LoanPurpose, LoanRequest,
    LoanStatus, ManualFlag, NewAccount, Role,
};
use crate::error::{LoanError, LoanResult};
use crate::rules::RuleEngine;
use crate::service::LoanService;
use axum::{
    async_trait,
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    rules: Arc<RuleEngine>,
    token_ttl_hours: i64,
}

impl AppState {
    pub fn new(conn: Connection, config: &Config) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
            rules: Arc::new(RuleEngine::new(config.flag_rules.clone())),
            token_ttl_hours: config.token_ttl_hours,
        }
    }

    /// Lock the shared connection, recovering a lock poisoned by a panicked
    /// request. Open transactions roll back on drop, so the connection is
    /// still consistent.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| {
            warn!("recovering database lock poisoned by a panicked request");
            self.db.clear_poison();
            PoisonError::into_inner(poisoned)
        })
    }
}

// ============================================================================
// ERROR RESPONSES
// ============================================================================

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: &'static str,
    message: String,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for LoanError {
    fn into_response(self) -> Response {
        if let LoanError::Internal(ref e) = self {
            error!(error = ?e, "request failed with internal error");
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match &self {
            LoanError::Validation { field, message } => {
                let mut map = serde_json::Map::new();
                map.insert(field.clone(), serde_json::Value::String(message.clone()));
                Some(serde_json::Value::Object(map))
            }
            _ => None,
        };
        let body = ErrorBody {
            status: "error",
            error: self.code(),
            message: self.public_message(),
            code: status.as_u16(),
            detail,
        };

        (status, Json(body)).into_response()
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> LoanResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| LoanError::validation("body", rejection.body_text()))
}

fn parse_id(raw: &str) -> LoanResult<i64> {
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| LoanError::validation("id", format!("'{}' is not a valid loan id", raw)))
}

// ============================================================================
// AUTHENTICATED ACCOUNT EXTRACTOR
// ============================================================================

/// The account behind the request's bearer token
pub struct AuthAccount(pub Account);

#[async_trait]
impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = LoanError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| {
                LoanError::Authentication("Authentication credentials were not provided".to_string())
            })?
            .to_str()
            .map_err(|_| LoanError::Authentication("Malformed authorization header".to_string()))?;

        let token = parse_authorization(header_value).ok_or_else(|| {
            LoanError::Authentication("Expected 'Bearer <token>' authorization".to_string())
        })?;

        let conn = state.conn();
        let account = AuthService::new(&conn, state.token_ttl_hours).authenticate(token)?;
        Ok(AuthAccount(account))
    }
}

// ============================================================================
// RESPONSE SHAPES
// ============================================================================

#[derive(Serialize)]
struct MessageResponse<T> {
    message: &'static str,
    data: T,
}

#[derive(Serialize)]
struct AccountResponse {
    id: i64,
    username: String,
    full_name: String,
    role: Role,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            full_name: account.full_name(),
            username: account.username,
            role: account.role,
        }
    }
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
    username: String,
    role: Role,
}

/// Loan application as returned to clients
#[derive(Serialize, Deserialize)]
pub struct LoanResponse {
    pub id: i64,
    pub account_id: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub applicant: Option<ApplicantSummary>,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stated_income: Option<Decimal>,
    pub purpose: LoanPurpose,
    pub status: LoanStatus,
    pub flagged: bool,
    pub flag_reasons: Vec<FlagReason>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub flags: Vec<FraudFlag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanResponse {
    /// Customers see reasons only; admins also get the applicant and who
    /// flagged and why
    fn render(loan: LoanApplication, viewer: &Account) -> Self {
        let flag_reasons = loan.flag_reasons();
        let (applicant, flags) = if viewer.role == Role::Admin {
            (Some(loan.applicant), loan.flags)
        } else {
            (None, Vec::new())
        };

        Self {
            id: loan.id,
            account_id: loan.account_id,
            applicant,
            amount: loan.amount,
            stated_income: loan.stated_income,
            purpose: loan.purpose,
            status: loan.status,
            flagged: loan.flagged,
            flag_reasons,
            flags,
            created_at: loan.created_at,
            updated_at: loan.updated_at,
        }
    }

    fn render_all(loans: Vec<LoanApplication>, viewer: &Account) -> Vec<Self> {
        loans.into_iter().map(|l| Self::render(l, viewer)).collect()
    }
}

#[derive(Serialize)]
struct DecisionResponse {
    status: LoanStatus,
    loan: LoanResponse,
}

#[derive(Serialize)]
struct FlagResponse {
    status: &'static str,
    loan_id: i64,
    message: &'static str,
    loan: LoanResponse,
}

// ============================================================================
// REQUEST SHAPES
// ============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize, Default)]
struct FlagRequest {
    #[serde(default)]
    reasons: Vec<ManualFlag>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health/ - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": crate::VERSION }))
}

/// POST /register/ - Create an account
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<NewAccount>, JsonRejection>,
) -> LoanResult<impl IntoResponse> {
    let input = json_body(payload)?;
    let conn = state.conn();
    let account = AuthService::new(&conn, state.token_ttl_hours).register(&input)?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "User registered successfully. Please log in to continue.",
            data: AccountResponse::from(account),
        }),
    ))
}

/// POST /login/ - Issue an auth token
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> LoanResult<impl IntoResponse> {
    let input = json_body(payload)?;
    let conn = state.conn();
    let issued = AuthService::new(&conn, state.token_ttl_hours).login(&input.username, &input.password)?;

    Ok(Json(MessageResponse {
        message: "Login successful",
        data: LoginResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            username: issued.account.username,
            role: issued.account.role,
        },
    }))
}

/// POST /loan/ - Submit an application
async fn submit_loan(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    payload: Result<Json<LoanRequest>, JsonRejection>,
) -> LoanResult<impl IntoResponse> {
    account.require(Capability::SubmitLoan)?;
    let request = json_body(payload)?;
    let conn = state.conn();
    let loan = LoanService::new(&conn, &state.rules).submit(&account, &request)?;

    Ok((StatusCode::CREATED, Json(LoanResponse::render(loan, &account))))
}

/// GET /loans/requests/ - The caller's own applications
async fn my_loans(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
) -> LoanResult<Json<Vec<LoanResponse>>> {
    let conn = state.conn();
    let loans = LoanService::new(&conn, &state.rules).list_own(&account)?;
    Ok(Json(LoanResponse::render_all(loans, &account)))
}

/// GET /loans/ - Every application, optionally filtered
async fn all_loans(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    filter: Result<Query<LoanFilter>, QueryRejection>,
) -> LoanResult<Json<Vec<LoanResponse>>> {
    let Query(filter) = filter.map_err(|r| LoanError::validation("query", r.body_text()))?;
    let conn = state.conn();
    let loans = LoanService::new(&conn, &state.rules).list_filtered(&account, &filter)?;
    Ok(Json(LoanResponse::render_all(loans, &account)))
}

/// GET /loans/flagged/ - Applications carrying the flagged marker
async fn flagged_loans(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
) -> LoanResult<Json<Vec<LoanResponse>>> {
    let conn = state.conn();
    let loans = LoanService::new(&conn, &state.rules).list_flagged(&account)?;
    Ok(Json(LoanResponse::render_all(loans, &account)))
}

/// GET /loans/:id/ - One application (own for customers, any for admins)
async fn get_loan(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(raw_id): Path<String>,
) -> LoanResult<Json<LoanResponse>> {
    let id = parse_id(&raw_id)?;
    let conn = state.conn();
    let loan = LoanService::new(&conn, &state.rules).get_for(&account, id)?;
    Ok(Json(LoanResponse::render(loan, &account)))
}

/// POST /loans/:id/approve/
async fn approve_loan(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(raw_id): Path<String>,
) -> LoanResult<Json<DecisionResponse>> {
    let id = parse_id(&raw_id)?;
    let conn = state.conn();
    let loan = LoanService::new(&conn, &state.rules).approve(&account, id)?;
    Ok(Json(DecisionResponse {
        status: loan.status,
        loan: LoanResponse::render(loan, &account),
    }))
}

/// POST /loans/:id/reject/
async fn reject_loan(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(raw_id): Path<String>,
) -> LoanResult<Json<DecisionResponse>> {
    let id = parse_id(&raw_id)?;
    let conn = state.conn();
    let loan = LoanService::new(&conn, &state.rules).reject(&account, id)?;
    Ok(Json(DecisionResponse {
        status: loan.status,
        loan: LoanResponse::render(loan, &account),
    }))
}

/// POST /loans/:id/flag/ - Body is optional: `{"reasons": [{"reason": "...", "comments": "..."}]}`
async fn flag_loan(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> LoanResult<Json<FlagResponse>> {
    let id = parse_id(&raw_id)?;
    let request: FlagRequest = if body.iter().all(u8::is_ascii_whitespace) {
        FlagRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| LoanError::validation("body", e.to_string()))?
    };

    let conn = state.conn();
    let loan = LoanService::new(&conn, &state.rules).flag(&account, id, &request.reasons)?;
    Ok(Json(FlagResponse {
        status: "flagged",
        loan_id: loan.id,
        message: "Application successfully flagged for fraud review.",
        loan: LoanResponse::render(loan, &account),
    }))
}

/// GET /loans/:id/history/ - Audit trail
async fn loan_history(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(raw_id): Path<String>,
) -> LoanResult<Json<Vec<Event>>> {
    let id = parse_id(&raw_id)?;
    let conn = state.conn();
    let events = LoanService::new(&conn, &state.rules).history(&account, id)?;
    Ok(Json(events))
}

async fn not_found() -> LoanError {
    LoanError::NotFound("No such endpoint".to_string())
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/", get(health_check))
        .route("/register/", post(register))
        .route("/login/", post(login))
        .route("/loan/", post(submit_loan))
        .route("/loans/", get(all_loans))
        .route("/loans/requests/", get(my_loans))
        .route("/loans/flagged/", get(flagged_loans))
        .route("/loans/:id/", get(get_loan))
        .route("/loans/:id/approve/", post(approve_loan))
        .route("/loans/:id/reject/", post(reject_loan))
        .route("/loans/:id/flag/", post(flag_loan))
        .route("/loans/:id/history/", get(loan_history))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
