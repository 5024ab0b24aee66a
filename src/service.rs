// 🏦 Loan Service - lifecycle and authorization
//
// Every operation starts with an explicit capability check on the acting
// account. Status moves only pending → approved | rejected, through a
// conditional update so a concurrent reviewer cannot overwrite a decision.
// The flag evaluator runs once, inside the submission transaction.

use crate::db::{self, Event};
use crate::entities::{
    Account, Capability, FlagReason, FraudFlag, LoanApplication, LoanFilter, LoanRequest,
    LoanStatus, ManualFlag,
};
use crate::error::{LoanError, LoanResult};
use crate::rules::{ApplicantHistory, FlagDecision, RuleEngine, SubmissionContext};
use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

// ============================================================================
// APPLICANT HISTORY SOURCE
// ============================================================================

/// Supplies the stored facts the history-dependent flag rules need
pub trait HistorySource {
    fn applicant_history(
        &self,
        conn: &Connection,
        account: &Account,
        window_hours: i64,
    ) -> anyhow::Result<ApplicantHistory>;
}

/// Counts prior applications and related accounts in the database
pub struct StoredHistory;

impl HistorySource for StoredHistory {
    fn applicant_history(
        &self,
        conn: &Connection,
        account: &Account,
        window_hours: i64,
    ) -> anyhow::Result<ApplicantHistory> {
        let since = Duration::try_hours(window_hours)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| anyhow::anyhow!("frequency window of {} hours is out of range", window_hours))?;

        let accounts_sharing_email_domain = match account.email_domain() {
            Some(domain) => db::count_customers_with_email_domain(conn, &domain)?,
            None => 0,
        };

        Ok(ApplicantHistory {
            recent_applications: db::count_recent_applications(conn, account.id, since)?,
            accounts_sharing_email_domain,
            duplicate_identity_accounts: db::count_duplicate_identities(conn, account)?,
        })
    }
}

// ============================================================================
// LOAN SERVICE
// ============================================================================

pub struct LoanService<'a> {
    conn: &'a Connection,
    rules: &'a RuleEngine,
    history: &'a dyn HistorySource,
}

impl<'a> LoanService<'a> {
    pub fn new(conn: &'a Connection, rules: &'a RuleEngine) -> Self {
        LoanService {
            conn,
            rules,
            history: &StoredHistory,
        }
    }

    /// Replace where applicant history comes from
    pub fn with_history(mut self, history: &'a dyn HistorySource) -> Self {
        self.history = history;
        self
    }

    // ========================================================================
    // CUSTOMER OPERATIONS
    // ========================================================================

    /// Create a pending application, flagging it if any rule matches
    pub fn submit(&self, account: &Account, request: &LoanRequest) -> LoanResult<LoanApplication> {
        account.require(Capability::SubmitLoan)?;
        request.validate()?;

        let window_hours = self.rules.thresholds().frequency_window_hours;
        let history = match self.history.applicant_history(self.conn, account, window_hours) {
            Ok(history) => Some(history),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "applicant history unavailable, history rules skipped");
                None
            }
        };

        let decision = self.rules.evaluate(&SubmissionContext {
            request,
            applicant: account,
            history,
        });

        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;

        let id = db::insert_loan(&tx, account.id, request, decision.flagged, now)?;
        for matched in &decision.matched {
            db::insert_fraud_flag(
                &tx,
                id,
                &FraudFlag {
                    reason: matched.reason,
                    source: matched.rule_id.clone(),
                    comments: String::new(),
                    created_at: now,
                },
            )?;
        }
        db::insert_event(
            &tx,
            &Event::new(
                "loan_submitted",
                "loan",
                &id.to_string(),
                serde_json::json!({
                    "amount": request.amount.to_string(),
                    "purpose": request.purpose.as_str(),
                    "flagged": decision.flagged,
                    "matched_rules": decision.rule_ids(),
                    "skipped_rules": decision.skipped,
                }),
                &account.username,
            ),
        )?;
        tx.commit()?;

        log_submission(id, account, &decision);

        self.load(id)
    }

    pub fn list_own(&self, account: &Account) -> LoanResult<Vec<LoanApplication>> {
        account.require(Capability::ViewOwnLoans)?;
        Ok(db::list_loans_by_account(self.conn, account.id)?)
    }

    /// One of the caller's own applications. Another customer's id is an
    /// authorization error, an unknown id is NotFound.
    pub fn get_own(&self, account: &Account, id: i64) -> LoanResult<LoanApplication> {
        account.require(Capability::ViewOwnLoans)?;

        let loan = self.load(id)?;
        if !loan.is_owned_by(account.id) {
            warn!(account_id = account.id, loan_id = id, "attempt to read another customer's application");
            return Err(LoanError::Authorization(
                "You do not have access to this loan application".to_string(),
            ));
        }
        Ok(loan)
    }

    // ========================================================================
    // ADMIN OPERATIONS
    // ========================================================================

    pub fn list_all(&self, admin: &Account) -> LoanResult<Vec<LoanApplication>> {
        self.list_filtered(admin, &LoanFilter::default())
    }

    pub fn list_filtered(
        &self,
        admin: &Account,
        filter: &LoanFilter,
    ) -> LoanResult<Vec<LoanApplication>> {
        admin.require(Capability::ViewAllLoans)?;
        filter.validate()?;
        Ok(db::list_loans(self.conn, filter)?)
    }

    pub fn get(&self, admin: &Account, id: i64) -> LoanResult<LoanApplication> {
        admin.require(Capability::ViewAllLoans)?;
        self.load(id)
    }

    /// Admins see any application, customers only their own
    pub fn get_for(&self, account: &Account, id: i64) -> LoanResult<LoanApplication> {
        if account.role.can(Capability::ViewAllLoans) {
            self.get(account, id)
        } else {
            self.get_own(account, id)
        }
    }

    pub fn approve(&self, admin: &Account, id: i64) -> LoanResult<LoanApplication> {
        self.decide(admin, id, LoanStatus::Approved, "loan_approved")
    }

    pub fn reject(&self, admin: &Account, id: i64) -> LoanResult<LoanApplication> {
        self.decide(admin, id, LoanStatus::Rejected, "loan_rejected")
    }

    /// Manually set the flagged marker. Status is left as it is; an empty
    /// reason list records a single `other` reason.
    pub fn flag(
        &self,
        admin: &Account,
        id: i64,
        reasons: &[ManualFlag],
    ) -> LoanResult<LoanApplication> {
        admin.require(Capability::ReviewLoans)?;
        for reason in reasons {
            reason.validate()?;
        }

        let default_reason = [ManualFlag {
            reason: FlagReason::Other,
            comments: String::new(),
        }];
        let reasons = if reasons.is_empty() {
            &default_reason[..]
        } else {
            reasons
        };

        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;

        if !db::set_flagged(&tx, id, now)? {
            return Err(LoanError::loan_not_found(id));
        }
        for manual in reasons {
            db::insert_fraud_flag(
                &tx,
                id,
                &FraudFlag {
                    reason: manual.reason,
                    source: admin.username.clone(),
                    comments: manual.comments.clone(),
                    created_at: now,
                },
            )?;
        }
        let reason_names: Vec<&str> = reasons.iter().map(|r| r.reason.as_str()).collect();
        db::insert_event(
            &tx,
            &Event::new(
                "loan_flagged",
                "loan",
                &id.to_string(),
                serde_json::json!({ "reasons": reason_names }),
                &admin.username,
            ),
        )?;
        tx.commit()?;

        warn!(loan_id = id, admin = %admin.username, reasons = ?reason_names, "loan flagged for fraud review");

        self.load(id)
    }

    pub fn list_flagged(&self, admin: &Account) -> LoanResult<Vec<LoanApplication>> {
        admin.require(Capability::ReviewLoans)?;
        Ok(db::list_flagged_loans(self.conn)?)
    }

    /// Audit trail of one application, oldest first
    pub fn history(&self, admin: &Account, id: i64) -> LoanResult<Vec<Event>> {
        admin.require(Capability::ViewAuditTrail)?;
        self.load(id)?;
        Ok(db::get_events_for_entity(self.conn, "loan", &id.to_string())?)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn load(&self, id: i64) -> LoanResult<LoanApplication> {
        db::get_loan(self.conn, id)?.ok_or_else(|| LoanError::loan_not_found(id))
    }

    fn decide(
        &self,
        admin: &Account,
        id: i64,
        to: LoanStatus,
        event_type: &str,
    ) -> LoanResult<LoanApplication> {
        admin.require(Capability::ReviewLoans)?;

        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;

        if !db::transition_status(&tx, id, to, now)? {
            // Either the id is unknown or the row is no longer pending
            let current = db::get_loan(&tx, id)?.ok_or_else(|| LoanError::loan_not_found(id))?;
            if !current.status.is_terminal() {
                return Err(LoanError::Internal(anyhow::anyhow!(
                    "loan {} is still {} but the status update matched no row",
                    id,
                    current.status.as_str()
                )));
            }
            return Err(LoanError::Conflict(format!(
                "Loan application {} is already {} and cannot be {}",
                id,
                current.status.as_str(),
                to.as_str()
            )));
        }

        db::insert_event(
            &tx,
            &Event::new(
                event_type,
                "loan",
                &id.to_string(),
                serde_json::json!({ "status": to.as_str() }),
                &admin.username,
            ),
        )?;
        tx.commit()?;

        info!(loan_id = id, admin = %admin.username, status = to.as_str(), "loan decision recorded");

        self.load(id)
    }

}

fn log_submission(id: i64, account: &Account, decision: &FlagDecision) {
    if decision.flagged {
        warn!(
            loan_id = id,
            account_id = account.id,
            rules = ?decision.rule_ids(),
            skipped = ?decision.skipped,
            "loan submitted and flagged for review"
        );
    } else {
        info!(
            loan_id = id,
            account_id = account.id,
            skipped = ?decision.skipped,
            "loan submitted"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthService;
    use crate::entities::{LoanPurpose, NewAccount, Role};
    use crate::rules::FlagThresholds;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn register_customer(conn: &Connection, username: &str, phone: &str) -> Account {
        AuthService::new(conn, 24)
            .register(&NewAccount {
                username: username.to_string(),
                password: "password123".to_string(),
                first_name: "Test".to_string(),
                last_name: username.to_string(),
                email: format!("{}@{}.test", username, username),
                role: Role::Customer,
                phone_number: Some(phone.to_string()),
                date_of_birth: NaiveDate::from_ymd_opt(2001, 2, 3),
            })
            .unwrap()
    }

    fn register_admin(conn: &Connection, username: &str) -> Account {
        AuthService::new(conn, 24)
            .register(&NewAccount {
                username: username.to_string(),
                password: "password123".to_string(),
                first_name: "Review".to_string(),
                last_name: "Admin".to_string(),
                email: format!("{}@bank.test", username),
                role: Role::Admin,
                phone_number: None,
                date_of_birth: None,
            })
            .unwrap()
    }

    fn request(amount: i64, income: Option<i64>) -> LoanRequest {
        LoanRequest {
            amount: Decimal::from(amount),
            stated_income: income.map(Decimal::from),
            purpose: LoanPurpose::Personal,
        }
    }

    #[test]
    fn test_submission_starts_pending_and_unflagged() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");

        let loan = service.submit(&ada, &request(50_000, Some(60_000))).unwrap();

        assert_eq!(loan.status, LoanStatus::Pending);
        assert!(!loan.flagged);
        assert!(loan.flags.is_empty());
        assert_eq!(loan.account_id, ada.id);
    }

    #[test]
    fn test_income_ratio_scenario_flags_but_stays_pending() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");

        let loan = service.submit(&ada, &request(1_000_000, Some(20_000))).unwrap();

        assert_eq!(loan.status, LoanStatus::Pending);
        assert!(loan.flagged);
        assert_eq!(loan.flag_reasons(), vec![FlagReason::HighRiskProfile]);
        assert_eq!(loan.flags[0].source, "income_multiple");
    }

    #[test]
    fn test_frequency_rule_uses_history() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");

        for _ in 0..3 {
            assert!(!service.submit(&ada, &request(5_000, None)).unwrap().flagged);
        }
        let fourth = service.submit(&ada, &request(5_000, None)).unwrap();

        assert!(fourth.flagged);
        assert_eq!(fourth.flag_reasons(), vec![FlagReason::TooManyApplications]);
    }

    struct UnavailableHistory;

    impl HistorySource for UnavailableHistory {
        fn applicant_history(
            &self,
            _conn: &Connection,
            _account: &Account,
            _window_hours: i64,
        ) -> anyhow::Result<ApplicantHistory> {
            anyhow::bail!("history store offline")
        }
    }

    #[test]
    fn test_submission_succeeds_when_history_is_unavailable() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let ada = register_customer(&conn, "ada", "08000000001");

        let normal = LoanService::new(&conn, &rules);
        for _ in 0..3 {
            normal.submit(&ada, &request(5_000, None)).unwrap();
        }

        let degraded = LoanService::new(&conn, &rules).with_history(&UnavailableHistory);
        let loan = degraded.submit(&ada, &request(5_000, Some(60_000))).unwrap();

        assert_eq!(loan.status, LoanStatus::Pending);
        assert!(!loan.flagged);

        let events = degraded.history(&register_admin(&conn, "kemi"), loan.id).unwrap();
        let skipped = events[0].data["skipped_rules"].as_array().unwrap();
        let skipped: Vec<&str> = skipped.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(
            skipped,
            vec!["application_frequency", "shared_email_domain", "duplicate_identity"]
        );
    }

    #[test]
    fn test_out_of_range_window_degrades_instead_of_panicking() {
        let conn = test_db();
        let thresholds = FlagThresholds {
            frequency_window_hours: 9_000_000_000_000_000,
            ..FlagThresholds::default()
        };
        let rules = RuleEngine::new(thresholds);
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");

        let loan = service.submit(&ada, &request(1_000_000, Some(20_000))).unwrap();

        assert_eq!(loan.status, LoanStatus::Pending);
        assert_eq!(loan.flag_reasons(), vec![FlagReason::HighRiskProfile]);
        assert_eq!(service.list_own(&ada).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_request_is_rejected() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");

        let err = service.submit(&ada, &request(10, None)).unwrap_err();
        assert!(matches!(err, LoanError::Validation { .. }));
        assert!(service.list_own(&ada).unwrap().is_empty());
    }

    #[test]
    fn test_admin_cannot_submit_and_customer_cannot_review() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");

        let err = service.submit(&admin, &request(5_000, None)).unwrap_err();
        assert!(matches!(err, LoanError::Authorization(_)));

        let loan = service.submit(&ada, &request(5_000, None)).unwrap();
        assert!(matches!(service.approve(&ada, loan.id), Err(LoanError::Authorization(_))));
        assert!(matches!(service.reject(&ada, loan.id), Err(LoanError::Authorization(_))));
        assert!(matches!(service.flag(&ada, loan.id, &[]), Err(LoanError::Authorization(_))));
        assert!(matches!(service.list_all(&ada), Err(LoanError::Authorization(_))));
        assert!(matches!(service.list_flagged(&ada), Err(LoanError::Authorization(_))));
        assert!(matches!(service.get(&ada, loan.id), Err(LoanError::Authorization(_))));
        assert!(matches!(service.list_own(&admin), Err(LoanError::Authorization(_))));
    }

    #[test]
    fn test_ownership_isolation() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let bola = register_customer(&conn, "bola", "08000000002");

        let ada_loan = service.submit(&ada, &request(5_000, None)).unwrap();
        let bola_loan = service.submit(&bola, &request(7_000, None)).unwrap();

        let own: Vec<i64> = service.list_own(&ada).unwrap().iter().map(|l| l.id).collect();
        assert_eq!(own, vec![ada_loan.id]);

        assert_eq!(service.get_own(&ada, ada_loan.id).unwrap().id, ada_loan.id);
        assert!(matches!(
            service.get_own(&ada, bola_loan.id),
            Err(LoanError::Authorization(_))
        ));
        assert!(matches!(
            service.get_for(&bola, ada_loan.id),
            Err(LoanError::Authorization(_))
        ));
        assert!(matches!(service.get_own(&ada, 9_999), Err(LoanError::NotFound(_))));
    }

    #[test]
    fn test_approve_twice_conflicts() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");
        let loan = service.submit(&ada, &request(5_000, None)).unwrap();

        let approved = service.approve(&admin, loan.id).unwrap();
        assert_eq!(approved.status, LoanStatus::Approved);

        let again = service.approve(&admin, loan.id).unwrap_err();
        assert!(matches!(again, LoanError::Conflict(_)));
    }

    #[test]
    fn test_reject_after_approve_keeps_approved() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");
        let loan = service.submit(&ada, &request(5_000, None)).unwrap();
        service.approve(&admin, loan.id).unwrap();

        let err = service.reject(&admin, loan.id).unwrap_err();

        assert!(matches!(err, LoanError::Conflict(_)));
        assert_eq!(err.status_code(), 409);
        assert_eq!(service.get(&admin, loan.id).unwrap().status, LoanStatus::Approved);
    }

    #[test]
    fn test_flagged_pending_can_still_be_decided() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");
        let loan = service.submit(&ada, &request(1_000_000, Some(20_000))).unwrap();
        assert!(loan.flagged);

        let rejected = service.reject(&admin, loan.id).unwrap();
        assert_eq!(rejected.status, LoanStatus::Rejected);
        assert!(rejected.flagged);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let admin = register_admin(&conn, "kemi");

        assert!(matches!(service.approve(&admin, 404), Err(LoanError::NotFound(_))));
        assert!(matches!(service.flag(&admin, 404, &[]), Err(LoanError::NotFound(_))));
        assert!(matches!(service.get(&admin, 404), Err(LoanError::NotFound(_))));
    }

    #[test]
    fn test_manual_flag_keeps_status_and_records_reasons() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");
        let loan = service.submit(&ada, &request(5_000, None)).unwrap();
        service.approve(&admin, loan.id).unwrap();

        let flagged = service
            .flag(
                &admin,
                loan.id,
                &[ManualFlag {
                    reason: FlagReason::IncompleteKyc,
                    comments: "ID photo unreadable".to_string(),
                }],
            )
            .unwrap();

        assert!(flagged.flagged);
        assert_eq!(flagged.status, LoanStatus::Approved);
        assert_eq!(flagged.flags[0].source, "kemi");
        assert_eq!(flagged.flags[0].comments, "ID photo unreadable");

        let again = service.flag(&admin, loan.id, &[]).unwrap();
        assert_eq!(
            again.flag_reasons(),
            vec![FlagReason::IncompleteKyc, FlagReason::Other]
        );
    }

    #[test]
    fn test_list_flagged_matches_marker_for_every_status() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let bola = register_customer(&conn, "bola", "08000000002");
        let admin = register_admin(&conn, "kemi");

        let auto_flagged = service.submit(&ada, &request(1_000_000, Some(20_000))).unwrap();
        let clean_pending = service.submit(&ada, &request(5_000, None)).unwrap();
        let approved_then_flagged = service.submit(&ada, &request(6_000, None)).unwrap();
        let rejected_clean = service.submit(&bola, &request(7_000, None)).unwrap();

        service.approve(&admin, approved_then_flagged.id).unwrap();
        service.flag(&admin, approved_then_flagged.id, &[]).unwrap();
        service.reject(&admin, rejected_clean.id).unwrap();
        service.reject(&admin, auto_flagged.id).unwrap();

        let mut flagged: Vec<i64> = service
            .list_flagged(&admin)
            .unwrap()
            .iter()
            .map(|l| l.id)
            .collect();
        flagged.sort();

        let mut expected: Vec<i64> = service
            .list_all(&admin)
            .unwrap()
            .into_iter()
            .filter(|l| l.flagged)
            .map(|l| l.id)
            .collect();
        expected.sort();

        assert_eq!(flagged, expected);
        assert_eq!(flagged, vec![auto_flagged.id, approved_then_flagged.id]);
        assert!(!flagged.contains(&clean_pending.id));
    }

    #[test]
    fn test_history_records_lifecycle() {
        let conn = test_db();
        let rules = RuleEngine::default();
        let service = LoanService::new(&conn, &rules);
        let ada = register_customer(&conn, "ada", "08000000001");
        let admin = register_admin(&conn, "kemi");
        let loan = service.submit(&ada, &request(5_000, None)).unwrap();
        service.flag(&admin, loan.id, &[]).unwrap();
        service.approve(&admin, loan.id).unwrap();

        let events = service.history(&admin, loan.id).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();

        assert_eq!(kinds, vec!["loan_submitted", "loan_flagged", "loan_approved"]);
        assert_eq!(events[0].actor, "ada");
        assert_eq!(events[2].actor, "kemi");
        assert!(matches!(service.history(&ada, loan.id), Err(LoanError::Authorization(_))));
    }
}
