// 🚩 Flag Rules - Rules as Data
// Static fraud-risk predicates evaluated once, at submission time.
//
// Each rule is an independent (id, reason, predicate) entry. Every rule runs;
// the decision carries every match, not just the first. A predicate that lacks
// the input it needs reports "cannot evaluate" and does not match.
// Evaluation never fails a submission.

use crate::entities::{Account, FlagReason, LoanRequest};
use chrono::Datelike;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagThresholds {
    /// Amount may not exceed stated income times this factor
    pub max_income_multiple: Decimal,

    /// Amount above which older applicants are considered high risk
    pub large_amount: Decimal,

    /// Applicants born before this year count as "older"
    pub mature_birth_year: i32,

    pub frequency_window_hours: i64,

    /// Prior applications within the window that trigger a flag
    pub max_recent_applications: u32,

    /// Customers sharing one email domain above which it looks suspicious
    pub max_accounts_per_email_domain: u32,
}

impl Default for FlagThresholds {
    fn default() -> Self {
        FlagThresholds {
            max_income_multiple: Decimal::from(10),
            large_amount: Decimal::from(1_000_000),
            mature_birth_year: 2000,
            frequency_window_hours: 24,
            max_recent_applications: 3,
            max_accounts_per_email_domain: 10,
        }
    }
}

// ============================================================================
// EVALUATION INPUT
// ============================================================================

/// Facts about the applicant drawn from storage before evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicantHistory {
    /// Applications by this account inside the frequency window
    pub recent_applications: u32,

    /// Customer accounts (including this one) with the same email domain
    pub accounts_sharing_email_domain: u32,

    /// Other customer accounts sharing email, phone, or name plus birth date
    pub duplicate_identity_accounts: u32,
}

pub struct SubmissionContext<'a> {
    pub request: &'a LoanRequest,
    pub applicant: &'a Account,

    /// None when the history lookup failed; history rules then cannot run
    pub history: Option<ApplicantHistory>,
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// `Some(true)` matched, `Some(false)` not matched, `None` cannot evaluate
pub type Predicate = fn(&SubmissionContext<'_>, &FlagThresholds) -> Option<bool>;

#[derive(Clone)]
pub struct FlagRule {
    pub id: &'static str,
    pub reason: FlagReason,
    pub description: &'static str,
    pub predicate: Predicate,
}

impl std::fmt::Debug for FlagRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagRule")
            .field("id", &self.id)
            .field("reason", &self.reason)
            .finish()
    }
}

fn income_multiple(ctx: &SubmissionContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let income = ctx.request.stated_income.filter(|i| *i > Decimal::ZERO)?;
    let limit = income.checked_mul(t.max_income_multiple)?;
    Some(ctx.request.amount > limit)
}

fn large_amount_mature_applicant(ctx: &SubmissionContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let dob = ctx.applicant.date_of_birth?;
    Some(ctx.request.amount > t.large_amount && dob.year() < t.mature_birth_year)
}

fn application_frequency(ctx: &SubmissionContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let history = ctx.history?;
    Some(history.recent_applications >= t.max_recent_applications)
}

fn shared_email_domain(ctx: &SubmissionContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let history = ctx.history?;
    ctx.applicant.email_domain()?;
    Some(history.accounts_sharing_email_domain > t.max_accounts_per_email_domain)
}

fn duplicate_identity(ctx: &SubmissionContext<'_>, _t: &FlagThresholds) -> Option<bool> {
    let history = ctx.history?;
    Some(history.duplicate_identity_accounts > 0)
}

/// The built-in rule set, in evaluation order
pub fn default_rules() -> Vec<FlagRule> {
    vec![
        FlagRule {
            id: "income_multiple",
            reason: FlagReason::HighRiskProfile,
            description: "Requested amount exceeds a fixed multiple of stated income",
            predicate: income_multiple,
        },
        FlagRule {
            id: "large_amount_mature_applicant",
            reason: FlagReason::HighRiskProfile,
            description: "Large amount requested by an applicant born before the cutoff year",
            predicate: large_amount_mature_applicant,
        },
        FlagRule {
            id: "application_frequency",
            reason: FlagReason::TooManyApplications,
            description: "Too many applications from the same account within the window",
            predicate: application_frequency,
        },
        FlagRule {
            id: "shared_email_domain",
            reason: FlagReason::SuspiciousActivity,
            description: "Email domain shared by an unusual number of customers",
            predicate: shared_email_domain,
        },
        FlagRule {
            id: "duplicate_identity",
            reason: FlagReason::InconsistentInformation,
            description: "Identity fields match another customer account",
            predicate: duplicate_identity,
        },
    ]
}

// ============================================================================
// FLAG DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedRule {
    pub rule_id: String,
    pub reason: FlagReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlagDecision {
    pub flagged: bool,
    pub matched: Vec<MatchedRule>,

    /// Rules that could not run for lack of input
    pub skipped: Vec<String>,
}

impl FlagDecision {
    pub fn rule_ids(&self) -> Vec<&str> {
        self.matched.iter().map(|m| m.rule_id.as_str()).collect()
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<FlagRule>,
    thresholds: FlagThresholds,
}

impl RuleEngine {
    /// Engine with the built-in rules
    pub fn new(thresholds: FlagThresholds) -> Self {
        RuleEngine::from_rules(default_rules(), thresholds)
    }

    pub fn from_rules(rules: Vec<FlagRule>, thresholds: FlagThresholds) -> Self {
        RuleEngine { rules, thresholds }
    }

    /// Run every rule against the submission
    pub fn evaluate(&self, ctx: &SubmissionContext<'_>) -> FlagDecision {
        let mut decision = FlagDecision::default();

        for rule in &self.rules {
            match (rule.predicate)(ctx, &self.thresholds) {
                Some(true) => decision.matched.push(MatchedRule {
                    rule_id: rule.id.to_string(),
                    reason: rule.reason,
                }),
                Some(false) => {}
                None => decision.skipped.push(rule.id.to_string()),
            }
        }

        decision.flagged = !decision.matched.is_empty();
        decision
    }

    pub fn thresholds(&self) -> &FlagThresholds {
        &self.thresholds
    }

    pub fn rules(&self) -> &[FlagRule] {
        &self.rules
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(FlagThresholds::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
