//! Sync command handlers

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tracing::info;

use classync_core::{SchedulerEvent, SyncService};

use crate::output::Output;

/// Run one sync cycle in the foreground
pub async fn sync(service: &SyncService, output: &Output) -> Result<()> {
    if !service.config().sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             classync config set sync_enabled true"
        );
    }

    output.message("Syncing...");
    let report = service.sync_now().await?;
    output.print_cycle(&report);

    if report.cancelled {
        output.message("Sync stopped before finishing.");
    } else {
        output.success("Sync complete");
    }
    Ok(())
}

/// Keep the scheduler running until Ctrl-C, then shut down cleanly
pub async fn run(mut service: SyncService, probe_secs: u64, output: &Output) -> Result<()> {
    if !service.config().sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             classync config set sync_enabled true"
        );
    }

    service.init()?;
    service.start_health_probe(Duration::from_secs(probe_secs.max(1)));
    let mut events = service.take_events();
    info!("Foreground sync running (probe every {}s)", probe_secs.max(1));

    output.message("Syncing in the background. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = next_event(&mut events) => match event {
                Some(SchedulerEvent::Stopped) | None => break,
                Some(event) => print_event(&event, output),
            },
        }
    }

    output.message("Stopping...");
    service.dispose().await;
    output.success("Stopped");
    Ok(())
}

async fn next_event(events: &mut Option<mpsc::Receiver<SchedulerEvent>>) -> Option<SchedulerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn print_event(event: &SchedulerEvent, output: &Output) {
    match event {
        SchedulerEvent::CycleFinished {
            trigger,
            report,
            pending,
            failures,
        } => {
            if output.is_json() {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "cycle_finished",
                        "trigger": format!("{:?}", trigger).to_lowercase(),
                        "report": report,
                        "pending": pending,
                        "failures": failures,
                    })
                );
            } else if report.uploaded + report.pulled + report.failed > 0 {
                output.message(&format!(
                    "[{:?}] uploaded {}, pulled {}, failed {}; {} pending, {} need attention",
                    trigger, report.uploaded, report.pulled, report.failed, pending, failures
                ));
            }
        }
        SchedulerEvent::Error(message) => {
            if output.is_json() {
                println!("{}", serde_json::json!({"event": "error", "message": message}));
            } else if !output.is_quiet() {
                eprintln!("⚠ {}", message);
            }
        }
        SchedulerEvent::Stopped => {}
    }
}
