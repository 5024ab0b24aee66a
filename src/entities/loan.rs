// 📄 Loan Application Entity
//
// Status and the flagged marker are separate axes:
// - status: pending → approved | rejected (terminal, admin action only)
// - flagged: set by the rule evaluator at creation or by an admin at any time

use crate::entities::account::ApplicantSummary;
use crate::error::{LoanError, LoanResult};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const MIN_LOAN_AMOUNT: i64 = 1_000;
pub const MAX_LOAN_AMOUNT: i64 = 5_000_000;

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Pending,
    Approved,
    Rejected,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Approved => "approved",
            LoanStatus::Rejected => "rejected",
        }
    }

    /// Approved and rejected admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoanStatus::Approved | LoanStatus::Rejected)
    }
}

impl FromStr for LoanStatus {
    type Err = LoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(LoanStatus::Pending),
            "approved" => Ok(LoanStatus::Approved),
            "rejected" => Ok(LoanStatus::Rejected),
            other => Err(LoanError::validation(
                "status",
                format!("Unknown status '{}'", other),
            )),
        }
    }
}

// ============================================================================
// PURPOSE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanPurpose {
    Personal,
    Business,
    Education,
    Medical,
    Other,
}

impl LoanPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanPurpose::Personal => "personal",
            LoanPurpose::Business => "business",
            LoanPurpose::Education => "education",
            LoanPurpose::Medical => "medical",
            LoanPurpose::Other => "other",
        }
    }
}

impl FromStr for LoanPurpose {
    type Err = LoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(LoanPurpose::Personal),
            "business" => Ok(LoanPurpose::Business),
            "education" => Ok(LoanPurpose::Education),
            "medical" => Ok(LoanPurpose::Medical),
            "other" => Ok(LoanPurpose::Other),
            other => Err(LoanError::validation(
                "purpose",
                format!("Unknown purpose '{}'", other),
            )),
        }
    }
}

// ============================================================================
// FRAUD FLAGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    SuspiciousActivity,
    IncompleteKyc,
    InconsistentInformation,
    HighRiskProfile,
    UnusualTransaction,
    TooManyApplications,
    Other,
}

impl FlagReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagReason::SuspiciousActivity => "suspicious_activity",
            FlagReason::IncompleteKyc => "incomplete_kyc",
            FlagReason::InconsistentInformation => "inconsistent_information",
            FlagReason::HighRiskProfile => "high_risk_profile",
            FlagReason::UnusualTransaction => "unusual_transaction",
            FlagReason::TooManyApplications => "too_many_applications",
            FlagReason::Other => "other",
        }
    }
}

impl FromStr for FlagReason {
    type Err = LoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "suspicious_activity" => Ok(FlagReason::SuspiciousActivity),
            "incomplete_kyc" => Ok(FlagReason::IncompleteKyc),
            "inconsistent_information" => Ok(FlagReason::InconsistentInformation),
            "high_risk_profile" => Ok(FlagReason::HighRiskProfile),
            "unusual_transaction" => Ok(FlagReason::UnusualTransaction),
            "too_many_applications" => Ok(FlagReason::TooManyApplications),
            "other" => Ok(FlagReason::Other),
            other => Err(LoanError::validation(
                "reason",
                format!("Unknown flag reason '{}'", other),
            )),
        }
    }
}

/// One recorded reason for a flag. `source` is the rule id for automatic
/// flags and the admin's username for manual ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFlag {
    pub reason: FlagReason,
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

/// Reason supplied by an admin when flagging manually
#[derive(Debug, Clone, Deserialize)]
pub struct ManualFlag {
    pub reason: FlagReason,
    #[serde(default)]
    pub comments: String,
}

pub const MAX_FLAG_COMMENT_LEN: usize = 500;

impl ManualFlag {
    pub fn validate(&self) -> LoanResult<()> {
        if self.comments.chars().count() > MAX_FLAG_COMMENT_LEN {
            return Err(LoanError::validation(
                "comments",
                format!("Comments must be at most {} characters", MAX_FLAG_COMMENT_LEN),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// LOAN APPLICATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplication {
    pub id: i64,

    /// Owning customer account
    pub account_id: i64,

    pub applicant: ApplicantSummary,

    pub amount: Decimal,

    /// Income the applicant declared with the request, if any
    pub stated_income: Option<Decimal>,

    pub purpose: LoanPurpose,
    pub status: LoanStatus,
    pub flagged: bool,
    pub flags: Vec<FraudFlag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanApplication {
    pub fn is_owned_by(&self, account_id: i64) -> bool {
        self.account_id == account_id
    }

    /// Distinct reasons in first-recorded order
    pub fn flag_reasons(&self) -> Vec<FlagReason> {
        let mut reasons = Vec::new();
        for flag in &self.flags {
            if !reasons.contains(&flag.reason) {
                reasons.push(flag.reason);
            }
        }
        reasons
    }
}

// ============================================================================
// SUBMISSION INPUT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LoanRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub stated_income: Option<Decimal>,
    pub purpose: LoanPurpose,
}

impl LoanRequest {
    pub fn validate(&self) -> LoanResult<()> {
        let min = Decimal::from(MIN_LOAN_AMOUNT);
        let max = Decimal::from(MAX_LOAN_AMOUNT);

        if self.amount < min || self.amount > max {
            return Err(LoanError::validation(
                "amount",
                format!("Amount must be between {} and {}", min, max),
            ));
        }
        if self.amount.normalize().scale() > 2 {
            return Err(LoanError::validation(
                "amount",
                "Amount may have at most 2 decimal places",
            ));
        }

        if let Some(income) = self.stated_income {
            if income <= Decimal::ZERO {
                return Err(LoanError::validation(
                    "stated_income",
                    "Stated income must be positive",
                ));
            }
        }

        Ok(())
    }
}

// ============================================================================
// ADMIN LIST FILTER
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoanFilter {
    #[serde(default)]
    pub status: Option<LoanStatus>,
    #[serde(default)]
    pub flagged: Option<bool>,

    /// Case-insensitive substring of the applicant's email
    #[serde(default)]
    pub user_email: Option<String>,

    /// Inclusive bounds on the application date
    #[serde(default)]
    pub applied_after: Option<NaiveDate>,
    #[serde(default)]
    pub applied_before: Option<NaiveDate>,
}

impl LoanFilter {
    pub fn validate(&self) -> LoanResult<()> {
        if let (Some(after), Some(before)) = (self.applied_after, self.applied_before) {
            if after > before {
                return Err(LoanError::validation(
                    "applied_after",
                    "applied_after must not be later than applied_before",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
