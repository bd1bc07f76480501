//! Login command handler
//!
//! Signing in runs the identity conflict check first. When the device still
//! holds someone else's data the user decides whether to clear it; keeping
//! it leaves sync blocked until it is cleared.

use anyhow::{bail, Result};

use classync_core::{Error, HydrationReport, Role, Session, SyncService};

use crate::output::Output;
use crate::prompt::{choose, confirm};

pub struct LoginArgs {
    pub user: String,
    pub role: Role,
    pub school: String,
    pub clear: bool,
    pub keep: bool,
    pub skip_hydration: bool,
}

/// Sign in, resolve conflicts and hydrate the cache
pub async fn login(service: &SyncService, args: LoginArgs, output: &Output) -> Result<()> {
    let session = Session::new(&args.user, args.role, &args.school);
    let check = service.check_conflict(&session.user_id)?;

    if check.has_conflict {
        let owner = check
            .existing_owner_label
            .unwrap_or_else(|| "another user".to_string());
        let clear = if args.clear {
            true
        } else if args.keep {
            false
        } else {
            ask_clear(&owner, output)?
        };

        let resolution = service.resolve(&session, clear).await?;
        if resolution.conflict_remaining {
            output.message(&format!(
                "Signed in as {}, keeping data of {}.\n\
                 Sync and downloads stay blocked until it is cleared:\n  \
                 classync login -u {} -r {} -s {} --clear",
                session.user_id, owner, session.user_id, session.role, session.school_id
            ));
            return Ok(());
        }
        output.message(&format!("Cleared data of {}.", owner));
    } else {
        service.activate(&session).await?;
    }

    output.success(&format!("Signed in as {} ({})", session.user_id, session.role));

    if args.skip_hydration {
        output.message("Skipped download; run `classync sync` when ready.");
        return Ok(());
    }

    hydrate(service, output).await
}

fn ask_clear(owner: &str, output: &Output) -> Result<bool> {
    if !output.should_prompt() {
        bail!(
            "This device holds data belonging to {}.\n\
             Re-run with --clear to remove it or --keep to retain it.",
            owner
        );
    }

    let question = format!(
        "This device holds data belonging to {}. Unsynced changes in it will be lost if cleared.",
        owner
    );
    match choose(&question, &["Clear it and continue", "Keep it (sync stays blocked)"])? {
        Some(0) => Ok(true),
        Some(_) => Ok(false),
        None => bail!("Invalid choice. Please run the command again and enter 1 or 2."),
    }
}

/// Download the snapshot, offering a retry when a fetch fails
async fn hydrate(service: &SyncService, output: &Output) -> Result<()> {
    loop {
        output.message("Downloading your classes...");
        match service.hydrate_session().await {
            Ok(report) => {
                print_report(&report, output);
                return Ok(());
            }
            Err(e @ Error::Hydration { .. }) => {
                output.message(&format!("Download failed: {}", e));
                if output.should_prompt() && confirm("Try again?")? {
                    continue;
                }
                output.message("Skipped; your previous offline data is unchanged.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_report(report: &HydrationReport, output: &Output) {
    if output.is_json() {
        output.json(report);
        return;
    }
    for (entity_type, count) in &report.staged {
        output.message(&format!("  {:<11} {}", entity_type.to_string(), count));
    }
    output.success(&format!("Downloaded {} records", report.total()));
}
