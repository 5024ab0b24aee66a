// 🌐 End-to-end HTTP tests against an in-memory database

#![cfg(feature = "server")]

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use loan_desk::api::{router, AppState};
use loan_desk::{setup_database, Config};
use rusqlite::Connection;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    app_with(Config::default())
}

fn app_with(config: Config) -> Router {
    let conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();
    router(AppState::new(conn, &config))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register_customer(app: &Router, username: &str, phone: &str) -> String {
    let (status, _) = send(
        app,
        Method::POST,
        "/register/",
        None,
        Some(json!({
            "username": username,
            "password": "correct-horse",
            "first_name": username,
            "last_name": "Customer",
            "email": format!("{}@example.com", username),
            "role": "customer",
            "phone_number": phone,
            "date_of_birth": "1990-05-01"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    login(app, username).await
}

async fn register_admin(app: &Router, username: &str) -> String {
    let (status, _) = send(
        app,
        Method::POST,
        "/register/",
        None,
        Some(json!({
            "username": username,
            "password": "correct-horse",
            "first_name": "Loan",
            "last_name": "Officer",
            "email": format!("{}@bank.test", username),
            "role": "admin"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    login(app, username).await
}

async fn login(app: &Router, username: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/login/",
        None,
        Some(json!({ "username": username, "password": "correct-horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["token"].as_str().unwrap().to_string()
}

async fn submit(app: &Router, token: &str, amount: &str, income: &str) -> Value {
    let (status, body) = send(
        app,
        Method::POST,
        "/loan/",
        Some(token),
        Some(json!({ "amount": amount, "stated_income": income, "purpose": "business" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

#[tokio::test]
async fn test_health_check() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_requires_authentication() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/loans/", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "authentication_error");

    let (status, _) = send(&app, Method::GET, "/loans/", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let app = app();
    register_customer(&app, "ada", "08012345678").await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/login/",
        None,
        Some(json!({ "username": "ada", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_duplicate_username_conflicts() {
    let app = app();
    register_admin(&app, "officer").await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/register/",
        None,
        Some(json!({
            "username": "officer",
            "password": "correct-horse",
            "first_name": "Other",
            "last_name": "Officer",
            "email": "other@bank.test",
            "role": "admin"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_invalid_registration_reports_field() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/register/",
        None,
        Some(json!({
            "username": "ada",
            "password": "correct-horse",
            "first_name": "Ada",
            "last_name": "Obi",
            "email": "ada@example.com",
            "role": "customer",
            "date_of_birth": "1990-05-01"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(body["detail"]["phone_number"].is_string());
}

#[tokio::test]
async fn test_high_income_multiple_is_flagged_but_pending() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;

    let loan = submit(&app, &customer, "1000000", "20000").await;
    assert_eq!(loan["status"], "pending");
    assert_eq!(loan["flagged"], true);
    assert_eq!(loan["flag_reasons"], json!(["high_risk_profile"]));

    let clean = submit(&app, &customer, "50000", "20000").await;
    assert_eq!(clean["flagged"], false);
}

#[tokio::test]
async fn test_out_of_range_amount_is_rejected() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/loan/",
        Some(&customer),
        Some(json!({ "amount": "999", "purpose": "personal" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]["amount"].is_string());
}

#[tokio::test]
async fn test_role_boundaries() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;
    let admin = register_admin(&app, "officer").await;

    let (status, _) = send(&app, Method::GET, "/loans/", Some(&customer), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, Method::GET, "/loans/flagged/", Some(&customer), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        Method::POST,
        "/loan/",
        Some(&admin),
        Some(json!({ "amount": "5000", "purpose": "personal" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_review_lifecycle() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;
    let admin = register_admin(&app, "officer").await;

    let first = submit(&app, &customer, "5000", "20000").await;
    let second = submit(&app, &customer, "7000", "20000").await;
    let first_id = first["id"].as_i64().unwrap();
    let second_id = second["id"].as_i64().unwrap();

    let uri = format!("/loans/{}/approve/", first_id);
    let (status, body) = send(&app, Method::POST, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");

    let (status, body) = send(&app, Method::POST, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let reject_first = format!("/loans/{}/reject/", first_id);
    let (status, _) = send(&app, Method::POST, &reject_first, Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let reject_second = format!("/loans/{}/reject/", second_id);
    let (status, body) = send(&app, Method::POST, &reject_second, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rejected");

    let (status, _) = send(&app, Method::POST, "/loans/9999/approve/", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::POST, &uri, Some(&customer), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, mine) = send(&app, Method::GET, "/loans/requests/", Some(&customer), None).await;
    assert_eq!(status, StatusCode::OK);
    let statuses: Vec<&str> = mine
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.contains(&"approved"));
    assert!(statuses.contains(&"rejected"));
}

#[tokio::test]
async fn test_customer_cannot_read_another_customers_loan() {
    let app = app();
    let ada = register_customer(&app, "ada", "08012345678").await;
    let bola = register_customer(&app, "bola", "08087654321").await;

    let loan = submit(&app, &ada, "5000", "20000").await;
    let uri = format!("/loans/{}/", loan["id"].as_i64().unwrap());

    let (status, _) = send(&app, Method::GET, &uri, Some(&ada), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, Method::GET, &uri, Some(&bola), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, Method::GET, "/loans/9999/", Some(&bola), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/loans/abc/", Some(&bola), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_manual_flag_and_flagged_listing() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;
    let admin = register_admin(&app, "officer").await;

    let loan = submit(&app, &customer, "5000", "20000").await;
    let id = loan["id"].as_i64().unwrap();

    let (status, flagged) = send(&app, Method::GET, "/loans/flagged/", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(flagged.as_array().unwrap().is_empty());

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/loans/{}/flag/", id),
        Some(&admin),
        Some(json!({ "reasons": [{ "reason": "incomplete_kyc", "comments": "ID expired" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "flagged");
    assert_eq!(body["loan"]["status"], "pending");
    assert_eq!(body["loan"]["flagged"], true);

    let (_, flagged) = send(&app, Method::GET, "/loans/flagged/", Some(&admin), None).await;
    let ids: Vec<i64> = flagged
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![id]);

    let (status, filtered) =
        send(&app, Method::GET, "/loans/?flagged=true&status=pending", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(filtered.as_array().unwrap().len(), 1);

    let (status, history) = send(
        &app,
        Method::GET,
        &format!("/loans/{}/history/", id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types.first(), Some(&"loan_submitted"));
    assert!(types.contains(&"loan_flagged"));
}

#[tokio::test]
async fn test_unknown_route_is_json_not_found() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/nowhere/", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_admin_views_include_applicant() {
    let app = app();
    let customer = register_customer(&app, "ada", "08012345678").await;
    let admin = register_admin(&app, "officer").await;

    let loan = submit(&app, &customer, "1000000", "20000").await;
    assert!(loan.get("applicant").is_none());
    let uri = format!("/loans/{}/", loan["id"].as_i64().unwrap());

    let (status, own) = send(&app, Method::GET, &uri, Some(&customer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(own.get("applicant").is_none());

    let (status, reviewed) = send(&app, Method::GET, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviewed["applicant"]["id"], loan["account_id"]);
    assert_eq!(reviewed["applicant"]["full_name"], "ada Customer");
    assert_eq!(reviewed["applicant"]["email"], "ada@example.com");
    assert_eq!(reviewed["applicant"]["phone_number"], "08012345678");

    let (_, all) = send(&app, Method::GET, "/loans/", Some(&admin), None).await;
    assert_eq!(all[0]["applicant"]["email"], "ada@example.com");

    let (_, flagged) = send(&app, Method::GET, "/loans/flagged/", Some(&admin), None).await;
    assert_eq!(flagged[0]["applicant"]["full_name"], "ada Customer");
}

#[tokio::test]
async fn test_out_of_range_window_does_not_take_server_down() {
    let mut config = Config::default();
    config.flag_rules.frequency_window_hours = 9_000_000_000_000_000;
    let app = app_with(config);
    let customer = register_customer(&app, "ada", "08012345678").await;

    let loan = submit(&app, &customer, "5000", "20000").await;
    assert_eq!(loan["status"], "pending");

    let (status, mine) = send(&app, Method::GET, "/loans/requests/", Some(&customer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine.as_array().unwrap().len(), 1);
}
