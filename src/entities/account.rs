// 👤 Account Entity - registered user with exactly one role
//
// Role is DATA, not a type hierarchy: every operation asks the account for a
// capability and the role answers from a fixed table.

use crate::error::{LoanError, LoanResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// ROLE & CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Applies for loans and reads their own applications
    #[serde(alias = "CUSTOMER")]
    Customer,

    /// Reviews every application (LoanAdmin)
    #[serde(alias = "ADMIN")]
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SubmitLoan,
    ViewOwnLoans,
    ViewAllLoans,
    ReviewLoans,
    ViewAuditTrail,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Admin => "admin",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::Customer => &[Capability::SubmitLoan, Capability::ViewOwnLoans],
            Role::Admin => &[
                Capability::ViewAllLoans,
                Capability::ReviewLoans,
                Capability::ViewAuditTrail,
            ],
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl FromStr for Role {
    type Err = LoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "admin" => Ok(Role::Admin),
            other => Err(LoanError::validation(
                "role",
                format!("Role must be either 'admin' or 'customer', got '{}'", other),
            )),
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

/// A registered user. Credentials live only in storage and never leave it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub email: String,

    /// Customers only, 11 digits without country code
    pub phone_number: Option<String>,

    /// Customers only
    pub date_of_birth: Option<NaiveDate>,

    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Domain part of the email address, lowercased
    pub fn email_domain(&self) -> Option<String> {
        email_domain(&self.email)
    }

    /// Fail with an authorization error unless the role grants `capability`
    pub fn require(&self, capability: Capability) -> LoanResult<()> {
        if self.role.can(capability) {
            Ok(())
        } else {
            Err(LoanError::Authorization(format!(
                "Accounts with role '{}' may not perform this action",
                self.role.as_str()
            )))
        }
    }
}

/// Applicant details embedded in reviewer views of an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantSummary {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub phone_number: Option<String>,
}

impl From<&Account> for ApplicantSummary {
    fn from(account: &Account) -> Self {
        ApplicantSummary {
            id: account.id,
            full_name: account.full_name(),
            email: account.email.clone(),
            phone_number: account.phone_number.clone(),
        }
    }
}

pub fn email_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .filter(|domain| !domain.is_empty())
}

// ============================================================================
// REGISTRATION INPUT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
}

const MAX_NAME_LEN: usize = 30;
const MIN_PASSWORD_LEN: usize = 8;
const PHONE_DIGITS: usize = 11;

impl NewAccount {
    /// Check shape and role-specific requirements; `today` bounds the date of birth
    pub fn validate(&self, today: NaiveDate) -> LoanResult<()> {
        let username = self.username.trim();
        if username.len() < 3 || username.len() > 150 {
            return Err(LoanError::validation(
                "username",
                "Username must be between 3 and 150 characters",
            ));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.@+-".contains(c))
        {
            return Err(LoanError::validation(
                "username",
                "Username may only contain letters, digits and _.@+-",
            ));
        }

        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(LoanError::validation(
                "password",
                format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
            ));
        }

        for (field, value) in [("first_name", &self.first_name), ("last_name", &self.last_name)] {
            let len = value.trim().chars().count();
            if len == 0 || len > MAX_NAME_LEN {
                return Err(LoanError::validation(
                    field,
                    format!("Must be between 1 and {} characters", MAX_NAME_LEN),
                ));
            }
        }

        if !is_valid_email(&self.email) {
            return Err(LoanError::validation("email", "Enter a valid email address"));
        }

        match self.role {
            Role::Admin => {
                if self.phone_number.is_some() {
                    return Err(LoanError::validation(
                        "phone_number",
                        "Phone number is not allowed for admins",
                    ));
                }
            }
            Role::Customer => {
                let phone = self.phone_number.as_deref().ok_or_else(|| {
                    LoanError::validation("phone_number", "Phone number is required for customers")
                })?;
                if phone.len() != PHONE_DIGITS || !phone.chars().all(|c| c.is_ascii_digit()) {
                    return Err(LoanError::validation(
                        "phone_number",
                        format!("Phone number must be exactly {} digits", PHONE_DIGITS),
                    ));
                }

                let dob = self.date_of_birth.ok_or_else(|| {
                    LoanError::validation("date_of_birth", "Date of birth is required for customers")
                })?;
                if dob >= today {
                    return Err(LoanError::validation(
                        "date_of_birth",
                        "Date of birth must be in the past",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.trim().split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

// ============================================================================
// TESTS
// ============================================================================
