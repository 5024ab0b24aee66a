// 🔐 Authentication - registration, login and bearer tokens
//
// Passwords: Argon2id, stored as a PHC string that carries its own salt.
// Tokens: random UUIDs handed out once; only their SHA-256 digest is stored.

use crate::db::{self, Event, StoredCredentials};
use crate::entities::{Account, NewAccount};
use crate::error::{LoanError, LoanResult};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Argon2id hash of `password` under a fresh random salt, in PHC format
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to encode password salt: {}", e))?;

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;

    Ok(hash.to_string())
}

pub fn new_credentials(password: &str) -> anyhow::Result<StoredCredentials> {
    Ok(StoredCredentials {
        password_hash: hash_password(password)?,
    })
}

pub fn verify_password(password: &str, stored: &StoredCredentials) -> bool {
    let parsed = match PasswordHash::new(&stored.password_hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "stored password hash is not a valid PHC string");
            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Extract the token from `Bearer <token>` or `Token <token>`
pub fn parse_authorization(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
        Some(token)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub account: Account,
}

// ============================================================================
// AUTH SERVICE
// ============================================================================

pub struct AuthService<'a> {
    conn: &'a Connection,
    token_ttl_hours: i64,
}

impl<'a> AuthService<'a> {
    pub fn new(conn: &'a Connection, token_ttl_hours: i64) -> Self {
        AuthService {
            conn,
            token_ttl_hours,
        }
    }

    /// Create an account with the given role
    pub fn register(&self, input: &NewAccount) -> LoanResult<Account> {
        let now = Utc::now();
        input.validate(now.date_naive())?;

        let username = input.username.trim();
        if db::username_exists(self.conn, username)? {
            return Err(LoanError::Conflict(format!(
                "Username '{}' is already taken",
                username
            )));
        }
        if let Some(phone) = input.phone_number.as_deref() {
            if db::phone_exists(self.conn, phone)? {
                return Err(LoanError::Conflict(
                    "Phone number is already registered".to_string(),
                ));
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        let credentials = new_credentials(&input.password)?;
        let id = db::insert_account(&tx, input, &credentials, now)?
            .ok_or_else(|| LoanError::Conflict("Account already exists".to_string()))?;

        db::insert_event(
            &tx,
            &Event::new(
                "account_registered",
                "account",
                &id.to_string(),
                serde_json::json!({ "role": input.role.as_str() }),
                username,
            ),
        )?;
        tx.commit()?;

        info!(account_id = id, role = input.role.as_str(), "account registered");

        db::get_account(self.conn, id)?
            .ok_or_else(|| LoanError::Internal(anyhow::anyhow!("account {} vanished after insert", id)))
    }

    /// Check credentials and issue a fresh token
    pub fn login(&self, username: &str, password: &str) -> LoanResult<IssuedToken> {
        let invalid = || LoanError::Authentication("Invalid username or password".to_string());

        let (account, credentials) =
            db::find_credentials(self.conn, username.trim())?.ok_or_else(|| {
                debug!("login attempt for unknown username");
                invalid()
            })?;

        if !verify_password(password, &credentials) {
            warn!(account_id = account.id, "failed login attempt");
            return Err(invalid());
        }

        let now = Utc::now();
        let token = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = Duration::try_hours(self.token_ttl_hours)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                LoanError::Internal(anyhow::anyhow!(
                    "token lifetime of {} hours is out of range",
                    self.token_ttl_hours
                ))
            })?;

        db::insert_token(self.conn, &hash_token(&token), account.id, now, expires_at)?;
        let purged = db::delete_expired_tokens(self.conn, now)?;
        if purged > 0 {
            debug!(purged, "removed expired tokens");
        }

        info!(account_id = account.id, "login succeeded");

        Ok(IssuedToken {
            token,
            expires_at,
            account,
        })
    }

    /// Resolve a bearer token to its account
    pub fn authenticate(&self, token: &str) -> LoanResult<Account> {
        db::find_account_by_token(self.conn, &hash_token(token), Utc::now())?.ok_or_else(|| {
            LoanError::Authentication("Invalid or expired authentication token".to_string())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
