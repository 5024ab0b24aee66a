// Loan Desk - Core Library
// Exposes all modules for use in the operator CLI, the API server, and tests

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod rules;
pub mod service;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use auth::{AuthService, IssuedToken};
pub use config::Config;
pub use db::{get_events_for_entity, insert_event, setup_database, Event};
pub use entities::{
    Account, ApplicantSummary, Capability, FlagReason, FraudFlag, LoanApplication, LoanFilter, LoanPurpose,
    LoanRequest, LoanStatus, ManualFlag, NewAccount, Role,
};
pub use error::{LoanError, LoanResult};
pub use rules::{
    ApplicantHistory, FlagDecision, FlagRule, FlagThresholds, MatchedRule, RuleEngine,
    SubmissionContext,
};
pub use service::{HistorySource, LoanService, StoredHistory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open a database file and make sure the schema exists
pub fn open_database<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// Install the global tracing subscriber; `RUST_LOG` overrides the default level
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
