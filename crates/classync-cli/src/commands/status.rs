//! Status and logout command handlers

use anyhow::Result;

use classync_core::store::shared;
use classync_core::{Config, LocalStore, SessionGuard};

use crate::output::{Output, OutputFormat};

/// Show session, queue and cache status
pub fn show(store: &LocalStore, config: &Config, output: &Output) -> Result<()> {
    let session = store.session()?;
    let pending = store.pending_count()?;
    let failures = store.failure_count()?;
    let counts = store.entity_counts()?;
    let cursors = store.cursors()?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "session": session,
                    "pending": pending,
                    "failures": failures,
                    "counts": counts
                        .iter()
                        .map(|(t, n)| (t.to_string(), *n))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                    "cursors": cursors,
                    "sync_enabled": config.sync_enabled,
                    "api_url": config.api_url,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Classync Status");
            println!("===============");
            println!();
            println!("Session:");
            match session {
                Some(ref s) => {
                    println!("  User:   {} ({})", s.user_id, s.role);
                    println!("  School: {}", s.school_id);
                    println!("  Since:  {}", s.authenticated_at.format("%Y-%m-%d %H:%M"));
                }
                None => println!("  Not signed in"),
            }
            println!();
            println!("Sync:");
            println!(
                "  Status:   {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.api_url {
                println!("  Server:   {}", url);
            }
            println!("  Pending:  {}", pending);
            println!("  Failed:   {}", failures);
            for cursor in &cursors {
                let at = cursor
                    .last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("  {:<11} last pulled {}", cursor.entity_type.to_string(), at);
            }
            println!();
            println!("Cache:");
            println!("  Location: {}", config.sqlite_path().display());
            for (entity_type, count) in &counts {
                println!("  {:<11} {}", entity_type.to_string(), count);
            }
        }
    }

    Ok(())
}

/// End the session; data stays until the next login decides
pub fn logout(store: LocalStore, output: &Output) -> Result<()> {
    let guard = SessionGuard::new(shared(store));
    let Some(session) = guard.active_session()? else {
        output.message("Not signed in.");
        return Ok(());
    };
    guard.end_session()?;
    output.success(&format!("Signed out {}", session.user_id));
    Ok(())
}
