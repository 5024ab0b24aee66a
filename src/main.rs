// Loan Desk - Operator CLI
// Schema setup and read-only review of flagged applications and audit trails

use anyhow::Result;
use clap::{Parser, Subcommand};
use loan_desk::{db, init_tracing, open_database, Config, LoanApplication, RuleEngine};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loan-desk")]
#[command(author, version, about = "Loan application review desk", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file path (overrides config and LOAN_DESK_DATABASE)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,

    /// Print applications carrying the fraud marker
    Flagged,

    /// Print the audit trail of one application
    History {
        /// Loan application id
        id: i64,
    },

    /// Print the fraud flag rules and their configured thresholds
    Rules,
}

fn main() -> Result<()> {
    init_tracing("info");

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Command::Init => run_init(&config),
        Command::Flagged => run_flagged(&config),
        Command::History { id } => run_history(&config, id),
        Command::Rules => run_rules(&config),
    }
}

fn run_init(config: &Config) -> Result<()> {
    println!("🔧 Setting up database at {:?}...", config.database_path);
    open_database(&config.database_path)?;
    println!("✓ Database initialized with WAL mode");
    Ok(())
}

fn run_flagged(config: &Config) -> Result<()> {
    let conn = open_database(&config.database_path)?;
    let loans = db::list_flagged_loans(&conn)?;

    println!("🚩 Flagged applications: {}", loans.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for loan in &loans {
        println!("{}", summary_line(loan));
        println!("    applicant: {} <{}>", loan.applicant.full_name, loan.applicant.email);
        for flag in &loan.flags {
            if flag.comments.is_empty() {
                println!("    - {} ({})", flag.reason.as_str(), flag.source);
            } else {
                println!(
                    "    - {} ({}): {}",
                    flag.reason.as_str(),
                    flag.source,
                    flag.comments
                );
            }
        }
    }
    Ok(())
}

fn run_history(config: &Config, id: i64) -> Result<()> {
    let conn = open_database(&config.database_path)?;
    let Some(loan) = db::get_loan(&conn, id)? else {
        anyhow::bail!("Loan application {} not found", id);
    };

    println!("📜 History for application #{}", loan.id);
    println!("{}", summary_line(&loan));
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for event in db::get_events_for_entity(&conn, "loan", &id.to_string())? {
        println!(
            "{}  {:<16} by {:<20} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.actor,
            event.data
        );
    }
    Ok(())
}

fn run_rules(config: &Config) -> Result<()> {
    let engine = RuleEngine::new(config.flag_rules.clone());

    println!("📋 Flag rules: {}", engine.rule_count());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for rule in engine.rules() {
        println!("{:<30} {:<24} {}", rule.id, rule.reason.as_str(), rule.description);
    }

    println!("\n{}", serde_json::to_string_pretty(engine.thresholds())?);
    Ok(())
}

fn summary_line(loan: &LoanApplication) -> String {
    format!(
        "#{:<6} account {:<6} {:>14} {:<10} {:<9} {}",
        loan.id,
        loan.account_id,
        loan.amount.to_string(),
        loan.purpose.as_str(),
        loan.status.as_str(),
        if loan.flagged { "🚩" } else { "" }
    )
}
