// 🗄️ Storage - SQLite schema and queries
//
// All functions take a plain &Connection so callers can run them inside a
// transaction (a Transaction derefs to Connection).
// Timestamps are stored as fixed-width RFC 3339 UTC text, which keeps
// lexicographic and chronological order identical. Money is decimal text.

use crate::entities::{
    Account, ApplicantSummary, FlagReason, FraudFlag, LoanApplication, LoanFilter, LoanPurpose, LoanRequest,
    LoanStatus, NewAccount, Role,
};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Event for audit trail: every state change is recorded with its actor
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Password hash as stored: a PHC string with the salt embedded
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub password_hash: String,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for file databases; in-memory databases report "memory" and that's fine
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('customer', 'admin')),
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone_number TEXT UNIQUE,
            date_of_birth TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            token_hash TEXT PRIMARY KEY,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            issued_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS loans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            amount TEXT NOT NULL,
            stated_income TEXT,
            purpose TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'rejected')),
            flagged INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fraud_flags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            loan_id INTEGER NOT NULL REFERENCES loans(id),
            reason TEXT NOT NULL,
            source TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_loans_account ON loans(account_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_loans_flagged ON loans(flagged);
        CREATE INDEX IF NOT EXISTS idx_fraud_flags_loan ON fraud_flags(loan_id);
        CREATE INDEX IF NOT EXISTS idx_auth_tokens_account ON auth_tokens(account_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);",
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_err(idx, e))
}

fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// ACCOUNTS
// ============================================================================

const ACCOUNT_COLUMNS: &str =
    "id, username, role, first_name, last_name, email, phone_number, date_of_birth, created_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let dob: Option<String> = row.get(7)?;
    let date_of_birth = dob
        .map(|text| NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| conversion_err(7, e)))
        .transpose()?;

    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        role: get_parsed::<Role>(row, 2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        email: row.get(5)?,
        phone_number: row.get(6)?,
        date_of_birth,
        created_at: get_timestamp(row, 8)?,
    })
}

/// Insert a new account. Returns None when a unique column is already taken.
pub fn insert_account(
    conn: &Connection,
    input: &NewAccount,
    credentials: &StoredCredentials,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let result = conn.execute(
        "INSERT INTO accounts (
            username, password_hash, role, first_name, last_name,
            email, phone_number, date_of_birth, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            input.username.trim(),
            credentials.password_hash,
            input.role.as_str(),
            input.first_name.trim(),
            input.last_name.trim(),
            input.email.trim(),
            input.phone_number,
            input.date_of_birth.map(date_text),
            timestamp(now),
        ],
    );

    match result {
        Ok(_) => Ok(Some(conn.last_insert_rowid())),
        Err(e) if is_constraint_violation(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn username_exists(conn: &Connection, username: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM accounts WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn phone_exists(conn: &Connection, phone_number: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM accounts WHERE phone_number = ?1",
            [phone_number],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn get_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
    let account = conn.query_row(&sql, [id], account_from_row).optional()?;
    Ok(account)
}

pub fn find_credentials(
    conn: &Connection,
    username: &str,
) -> Result<Option<(Account, StoredCredentials)>> {
    let sql = format!(
        "SELECT {}, password_hash FROM accounts WHERE username = ?1",
        ACCOUNT_COLUMNS
    );
    let found = conn
        .query_row(&sql, [username], |row| {
            let account = account_from_row(row)?;
            let credentials = StoredCredentials {
                password_hash: row.get(9)?,
            };
            Ok((account, credentials))
        })
        .optional()?;
    Ok(found)
}

// ============================================================================
// AUTH TOKENS
// ============================================================================

pub fn insert_token(
    conn: &Connection,
    token_hash: &str,
    account_id: i64,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO auth_tokens (token_hash, account_id, issued_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![token_hash, account_id, timestamp(issued_at), timestamp(expires_at)],
    )?;
    Ok(())
}

/// Account owning a token that has not expired at `now`
pub fn find_account_by_token(
    conn: &Connection,
    token_hash: &str,
    now: DateTime<Utc>,
) -> Result<Option<Account>> {
    let sql = format!(
        "SELECT {} FROM accounts
         WHERE id = (SELECT account_id FROM auth_tokens
                     WHERE token_hash = ?1 AND expires_at > ?2)",
        ACCOUNT_COLUMNS
    );
    let account = conn
        .query_row(&sql, params![token_hash, timestamp(now)], account_from_row)
        .optional()?;
    Ok(account)
}

pub fn delete_expired_tokens(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM auth_tokens WHERE expires_at <= ?1",
        [timestamp(now)],
    )?;
    Ok(removed)
}

// ============================================================================
// LOANS
// ============================================================================

const LOAN_COLUMNS: &str = "l.id, l.account_id, l.amount, l.stated_income, l.purpose, l.status, \
                            l.flagged, l.created_at, l.updated_at, \
                            a.first_name, a.last_name, a.email, a.phone_number";

/// Every loan query joins the applicant's account as `a`
const LOAN_FROM: &str = "FROM loans l JOIN accounts a ON a.id = l.account_id";

fn loan_from_row(row: &Row<'_>) -> rusqlite::Result<LoanApplication> {
    let income: Option<String> = row.get(3)?;
    let stated_income = income
        .map(|text| Decimal::from_str(&text).map_err(|e| conversion_err(3, e)))
        .transpose()?;

    let account_id: i64 = row.get(1)?;
    let first_name: String = row.get(9)?;
    let last_name: String = row.get(10)?;

    Ok(LoanApplication {
        id: row.get(0)?,
        account_id,
        applicant: ApplicantSummary {
            id: account_id,
            full_name: format!("{} {}", first_name, last_name).trim().to_string(),
            email: row.get(11)?,
            phone_number: row.get(12)?,
        },
        amount: get_decimal(row, 2)?,
        stated_income,
        purpose: get_parsed::<LoanPurpose>(row, 4)?,
        status: get_parsed::<LoanStatus>(row, 5)?,
        flagged: row.get(6)?,
        flags: Vec::new(),
        created_at: get_timestamp(row, 7)?,
        updated_at: get_timestamp(row, 8)?,
    })
}

fn load_flags(conn: &Connection, loan_id: i64) -> Result<Vec<FraudFlag>> {
    let mut stmt = conn.prepare(
        "SELECT reason, source, comments, created_at
         FROM fraud_flags
         WHERE loan_id = ?1
         ORDER BY id",
    )?;

    let flags = stmt
        .query_map([loan_id], |row| {
            Ok(FraudFlag {
                reason: get_parsed::<FlagReason>(row, 0)?,
                source: row.get(1)?,
                comments: row.get(2)?,
                created_at: get_timestamp(row, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(flags)
}

fn query_loans(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<LoanApplication>> {
    let mut stmt = conn.prepare(sql)?;
    let mut loans = stmt
        .query_map(params_from_iter(args), loan_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    for loan in &mut loans {
        loan.flags = load_flags(conn, loan.id)?;
    }

    Ok(loans)
}

/// Insert a pending application and return its id
pub fn insert_loan(
    conn: &Connection,
    account_id: i64,
    request: &LoanRequest,
    flagged: bool,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO loans (
            account_id, amount, stated_income, purpose, status, flagged, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            account_id,
            request.amount.to_string(),
            request.stated_income.map(|i| i.to_string()),
            request.purpose.as_str(),
            LoanStatus::Pending.as_str(),
            flagged,
            timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_fraud_flag(conn: &Connection, loan_id: i64, flag: &FraudFlag) -> Result<()> {
    conn.execute(
        "INSERT INTO fraud_flags (loan_id, reason, source, comments, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            loan_id,
            flag.reason.as_str(),
            flag.source,
            flag.comments,
            timestamp(flag.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_loan(conn: &Connection, id: i64) -> Result<Option<LoanApplication>> {
    let sql = format!("SELECT {} {} WHERE l.id = ?1", LOAN_COLUMNS, LOAN_FROM);
    let loan = conn.query_row(&sql, [id], loan_from_row).optional()?;

    match loan {
        Some(mut loan) => {
            loan.flags = load_flags(conn, loan.id)?;
            Ok(Some(loan))
        }
        None => Ok(None),
    }
}

pub fn list_loans_by_account(conn: &Connection, account_id: i64) -> Result<Vec<LoanApplication>> {
    let sql = format!(
        "SELECT {} {} WHERE l.account_id = ?1 ORDER BY l.created_at DESC, l.id DESC",
        LOAN_COLUMNS, LOAN_FROM
    );
    query_loans(conn, &sql, vec![Value::Integer(account_id)])
}

pub fn list_flagged_loans(conn: &Connection) -> Result<Vec<LoanApplication>> {
    let sql = format!(
        "SELECT {} {} WHERE l.flagged = 1 ORDER BY l.created_at DESC, l.id DESC",
        LOAN_COLUMNS, LOAN_FROM
    );
    query_loans(conn, &sql, Vec::new())
}

/// All applications matching the filter, newest first
pub fn list_loans(conn: &Connection, filter: &LoanFilter) -> Result<Vec<LoanApplication>> {
    let mut sql = format!("SELECT {} {} WHERE 1 = 1", LOAN_COLUMNS, LOAN_FROM);
    let mut args: Vec<Value> = Vec::new();

    if let Some(status) = filter.status {
        args.push(Value::Text(status.as_str().to_string()));
        sql.push_str(&format!(" AND l.status = ?{}", args.len()));
    }
    if let Some(flagged) = filter.flagged {
        args.push(Value::Integer(i64::from(flagged)));
        sql.push_str(&format!(" AND l.flagged = ?{}", args.len()));
    }
    if let Some(email) = filter.user_email.as_deref().filter(|e| !e.is_empty()) {
        args.push(Value::Text(email.to_lowercase()));
        sql.push_str(&format!(" AND instr(lower(a.email), ?{}) > 0", args.len()));
    }
    if let Some(after) = filter.applied_after {
        args.push(Value::Text(date_text(after)));
        sql.push_str(&format!(" AND l.created_at >= ?{}", args.len()));
    }
    if let Some(before) = filter.applied_before {
        // inclusive: anything before the start of the following day
        let next_day = before.succ_opt().unwrap_or(before);
        args.push(Value::Text(date_text(next_day)));
        sql.push_str(&format!(" AND l.created_at < ?{}", args.len()));
    }

    sql.push_str(" ORDER BY l.created_at DESC, l.id DESC");
    query_loans(conn, &sql, args)
}

/// Move a pending application to `to`. Returns false when no pending row
/// with that id exists, which covers both a missing id and a lost race.
pub fn transition_status(
    conn: &Connection,
    id: i64,
    to: LoanStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE loans SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), timestamp(now), id, LoanStatus::Pending.as_str()],
    )?;
    Ok(changed == 1)
}

/// Set the flagged marker; status is untouched. Returns false for unknown ids.
pub fn set_flagged(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE loans SET flagged = 1, updated_at = ?1 WHERE id = ?2",
        params![timestamp(now), id],
    )?;
    Ok(changed == 1)
}

// ============================================================================
// APPLICANT HISTORY (flag rule inputs)
// ============================================================================

pub fn count_recent_applications(
    conn: &Connection,
    account_id: i64,
    since: DateTime<Utc>,
) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM loans WHERE account_id = ?1 AND created_at >= ?2",
        params![account_id, timestamp(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_customers_with_email_domain(conn: &Connection, domain: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM accounts
         WHERE role = 'customer'
           AND substr(lower(email), instr(email, '@') + 1) = ?1",
        [domain.to_lowercase()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Other customer accounts sharing email, phone, or full name plus birth date
pub fn count_duplicate_identities(conn: &Connection, account: &Account) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM accounts
         WHERE role = 'customer' AND id != ?1
           AND (lower(email) = lower(?2)
                OR (?3 IS NOT NULL AND phone_number = ?3)
                OR (?6 IS NOT NULL
                    AND lower(first_name) = lower(?4)
                    AND lower(last_name) = lower(?5)
                    AND date_of_birth = ?6))",
        params![
            account.id,
            account.email,
            account.phone_number,
            account.first_name,
            account.last_name,
            account.date_of_birth.map(date_text),
        ],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            timestamp(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp, id",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: get_timestamp(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_err(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
