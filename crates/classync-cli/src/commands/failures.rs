//! Failed mutation command handlers

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use classync_core::{LocalStore, MutationId};

use crate::output::Output;

pub fn list(store: &LocalStore, output: &Output) -> Result<()> {
    let failures = store.failed_mutations()?;
    output.print_failures(&failures);
    Ok(())
}

pub fn retry(store: &mut LocalStore, id: &str, output: &Output) -> Result<()> {
    let mutation_id = resolve_id(store, id)?;
    if !store.retry_failed(mutation_id)? {
        bail!("Mutation {} is not in the failed list", mutation_id);
    }
    output.success(&format!("Queued {} for another attempt", mutation_id));
    Ok(())
}

pub fn discard(store: &mut LocalStore, id: &str, output: &Output) -> Result<()> {
    let mutation_id = resolve_id(store, id)?;
    if !store.discard_failed(mutation_id)? {
        bail!("Mutation {} is not in the failed list", mutation_id);
    }
    output.success(&format!("Discarded {}", mutation_id));
    Ok(())
}

/// Accept a full UUID or a unique prefix of a failed mutation's ID
fn resolve_id(store: &LocalStore, id: &str) -> Result<MutationId> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let prefix = id.to_lowercase();
    let matches: Vec<MutationId> = store
        .failed_mutations()
        .context("Failed to read failed mutations")?
        .into_iter()
        .map(|entry| entry.mutation_id)
        .filter(|m| m.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [one] => Ok(*one),
        [] => bail!("No failed mutation matches '{}'", id),
        _ => bail!(
            "'{}' matches {} failed mutations; use more characters",
            id,
            matches.len()
        ),
    }
}
