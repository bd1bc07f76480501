//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use classync_core::{CachedEntity, CycleReport, MutationLogEntry};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print cached entities of one type
    pub fn print_entities(&self, entities: &[CachedEntity]) {
        match self.format {
            OutputFormat::Human => {
                if entities.is_empty() {
                    println!("Nothing cached.");
                    return;
                }
                for entity in entities {
                    println!(
                        "{} | v{} | {} | {}",
                        truncate(&entity.entity_id, 24),
                        entity.version,
                        entity.sync_state,
                        truncate(&entity.payload.to_string(), 60)
                    );
                }
                println!("\n{} record(s)", entities.len());
            }
            OutputFormat::Json => self.json(entities),
            OutputFormat::Quiet => {
                for entity in entities {
                    println!("{}", entity.entity_id);
                }
            }
        }
    }

    /// Print mutations that need manual action
    pub fn print_failures(&self, failures: &[MutationLogEntry]) {
        match self.format {
            OutputFormat::Human => {
                if failures.is_empty() {
                    println!("No failed mutations.");
                    return;
                }
                for entry in failures {
                    println!("────────────────────────────────────────");
                    println!("ID:       {}", entry.mutation_id);
                    println!(
                        "Change:   {} {}/{}",
                        entry.operation, entry.entity_type, entry.entity_id
                    );
                    println!("Recorded: {}", entry.created_at.format("%Y-%m-%d %H:%M"));
                    println!("Attempts: {}", entry.attempts);
                    if let Some(ref error) = entry.last_error {
                        println!("Error:    {}", error);
                    }
                }
                println!("\n{} failed mutation(s)", failures.len());
                println!("Retry with `classync failures retry <id>` or drop with `classync failures discard <id>`.");
            }
            OutputFormat::Json => self.json(failures),
            OutputFormat::Quiet => {
                for entry in failures {
                    println!("{}", entry.mutation_id);
                }
            }
        }
    }

    /// Print the outcome of a sync cycle
    pub fn print_cycle(&self, report: &CycleReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Uploaded: {}", report.uploaded);
                if report.retried > 0 || report.deferred > 0 {
                    println!(
                        "Waiting:  {} (retrying {}, backing off {})",
                        report.retried + report.deferred,
                        report.retried,
                        report.deferred
                    );
                }
                if report.failed > 0 {
                    println!("Failed:   {} (see `classync failures`)", report.failed);
                }
                println!("Pulled:   {} ({} removed)", report.pulled, report.deleted);
                if report.skipped > 0 {
                    println!("Kept local copy of {} record(s) with unsent changes", report.skipped);
                }
                if report.pull_errors > 0 {
                    println!("Pull errors: {}", report.pull_errors);
                }
            }
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Whether interactive prompts make sense for this format
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
