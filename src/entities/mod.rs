// Entity Models
//
// - Account: who is acting, and which capabilities their role grants
// - LoanApplication: the reviewed object, with status and flagged marker

pub mod account;
pub mod loan;

pub use account::{email_domain, Account, ApplicantSummary, Capability, NewAccount, Role};
pub use loan::{
    FlagReason, FraudFlag, LoanApplication, LoanFilter, LoanPurpose, LoanRequest, LoanStatus,
    ManualFlag, MAX_LOAN_AMOUNT, MIN_LOAN_AMOUNT,
};
