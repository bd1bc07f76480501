//! Record and list command handlers

use anyhow::{Context, Result};
use serde_json::Value;

use classync_core::{EntityType, LocalStore, MutationOp, Recorded};

use crate::output::Output;

/// Queue a local change
pub fn record(
    store: &mut LocalStore,
    entity_type: EntityType,
    entity_id: &str,
    operation: MutationOp,
    payload: Option<&str>,
    output: &Output,
) -> Result<()> {
    let payload = parse_payload(payload)?;

    match store.record_mutation(entity_type, entity_id, operation, payload)? {
        Recorded::Queued(id) => {
            if output.is_json() {
                println!(
                    "{}",
                    serde_json::json!({"mutation_id": id, "status": "queued"})
                );
            } else if output.is_quiet() {
                println!("{}", id);
            } else {
                output.success(&format!(
                    "Queued {} {}/{} ({})",
                    operation, entity_type, entity_id, id
                ));
            }
        }
        Recorded::Cancelled { dropped } => {
            output.success(&format!(
                "{}/{} was never uploaded; dropped {} queued change(s)",
                entity_type, entity_id, dropped
            ));
        }
    }

    Ok(())
}

/// List visible cached records of one type
pub fn list(store: &LocalStore, entity_type: EntityType, output: &Output) -> Result<()> {
    let entities = store.entities(entity_type)?;
    output.print_entities(&entities);
    Ok(())
}

fn parse_payload(payload: Option<&str>) -> Result<Value> {
    match payload {
        Some(text) => serde_json::from_str(text).context("Payload must be valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}
