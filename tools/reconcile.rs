//! Offline ledger audit
//!
//! Replays every user's transaction log against their stored balance and,
//! optionally, re-derives the outcomes of every finished session. Run it
//! against a stopped server; RocksDB holds an exclusive lock on the directory.

use clap::Parser;
use fairplay::common::types::User;
use fairplay::config::{EngineConfig, StorageConfig};
use fairplay::session::GameEngine;
use fairplay::storage::OptimizedStorage;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Audit fairplay balances against the transaction log", long_about = None)]
struct Args {
    /// Database directory
    #[arg(long, default_value = "./DB/fairplay_data")]
    db_path: String,

    /// Only audit this username
    #[arg(long)]
    user: Option<String>,

    /// Also re-derive every resolved or cancelled session
    #[arg(long)]
    verify_sessions: bool,
}

const PAGE: usize = 200;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fairplay=warn".into()),
        )
        .init();

    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("reconcile failed: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let storage = OptimizedStorage::with_config(&StorageConfig {
        data_directory: args.db_path.clone(),
        clear_on_start: false,
        ..StorageConfig::default()
    })?;
    let engine = GameEngine::new(EngineConfig::default(), Arc::new(storage));

    let users: Vec<User> = match args.user {
        Some(ref name) => match engine.ledger().find_user(name)? {
            Some(user) => vec![user],
            None => return Err(format!("no user named {}", name).into()),
        },
        None => engine.ledger().users()?,
    };

    println!("Ledger audit of {} ({} users)", args.db_path, users.len());
    let mut all_ok = true;

    for user in &users {
        let report = engine.ledger().reconcile(&user.id)?;
        let status = if report.is_consistent() { "ok" } else { "MISMATCH" };
        println!(
            "  {:<20} balance={:<10} initial={:<10} confirmed={:<10} pending={} ({}) failed={} [{}]",
            user.username,
            report.balance,
            report.initial_balance,
            report.confirmed_sum,
            report.pending_sum,
            report.pending_count,
            report.failed_count,
            status
        );
        all_ok &= report.is_consistent();

        if args.verify_sessions {
            all_ok &= verify_sessions(&engine, user)?;
        }
    }

    println!("{}", if all_ok { "All checks passed" } else { "Audit found problems" });
    Ok(all_ok)
}

fn verify_sessions(engine: &GameEngine, user: &User) -> Result<bool, Box<dyn std::error::Error>> {
    let mut ok = true;
    let mut checked = 0usize;
    let mut cursor: Option<String> = None;

    loop {
        let (sessions, next) = engine.user_sessions(user.id, cursor.as_deref(), PAGE)?;
        for session in sessions.iter().filter(|s| s.status.is_terminal()) {
            let verification = engine.verify(session.id)?;
            checked += 1;
            if !verification.is_valid() {
                ok = false;
                println!(
                    "    session {} failed verification (commitment_valid={})",
                    session.id, verification.commitment_valid
                );
            }
        }
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }

    println!("    {} finished sessions verified", checked);
    Ok(ok)
}
