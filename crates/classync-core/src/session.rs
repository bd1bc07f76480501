//! Session guard
//!
//! A device may be shared between users. Before a new user's data is
//! hydrated, the guard checks whether the store still holds someone else's
//! rows and lets the caller decide between clearing and keeping them.
//! Keeping them never lets a session operate over mixed ownership: the
//! conflict is re-checked after resolution and hydration, mutation
//! recording and sync cycles refuse until it is cleared.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::Session;
use crate::store::{lock_store, LocalStore, SharedStore};

/// Result of a conflict check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    /// Who the resident data belongs to, for the conflict dialog
    pub existing_owner_label: Option<String>,
}

impl ConflictCheck {
    fn none() -> Self {
        Self {
            has_conflict: false,
            existing_owner_label: None,
        }
    }
}

/// Result of resolving a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub cleared: bool,
    /// True when kept data still belongs to someone else
    pub conflict_remaining: bool,
    pub existing_owner_label: Option<String>,
}

/// Detects and resolves identity conflicts on the local store
#[derive(Clone)]
pub struct SessionGuard {
    store: SharedStore,
}

impl SessionGuard {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Whether the store holds rows owned by anyone but `candidate_user_id`
    ///
    /// Read-only.
    pub fn check_conflict(&self, candidate_user_id: &str) -> Result<ConflictCheck> {
        let store = lock_store(&self.store)?;
        check(&store, candidate_user_id)
    }

    /// Make `candidate` the active session, clearing resident data first if asked
    ///
    /// Clearing drops every cached row and queued mutation of the previous
    /// owner, including unsynced work.
    pub fn resolve(&self, candidate: &Session, should_clear: bool) -> Result<Resolution> {
        let mut store = lock_store(&self.store)?;

        if should_clear {
            let lost = store.mutation_log()?.len();
            if lost > 0 {
                warn!(
                    "Clearing device data for {}: {} unsynced mutations discarded",
                    candidate.user_id, lost
                );
            }
        }

        store.begin_session(candidate, should_clear)?;

        let after = check(&store, &candidate.user_id)?;
        if after.has_conflict {
            warn!(
                "Kept data of {} on the device; hydration and sync are blocked until it is cleared",
                after.existing_owner_label.as_deref().unwrap_or("another user")
            );
        }

        Ok(Resolution {
            cleared: should_clear,
            conflict_remaining: after.has_conflict,
            existing_owner_label: after.existing_owner_label,
        })
    }

    /// Install a session when no conflict exists
    pub fn activate(&self, session: &Session) -> Result<()> {
        let mut store = lock_store(&self.store)?;
        let found = check(&store, &session.user_id)?;
        if let Some(label) = found.existing_owner_label {
            return Err(Error::Conflict {
                existing_owner: label,
            });
        }
        store.begin_session(session, false)?;
        Ok(())
    }

    pub fn active_session(&self) -> Result<Option<Session>> {
        Ok(lock_store(&self.store)?.session()?)
    }

    /// Sign out; cached data stays until the next login decides its fate
    pub fn end_session(&self) -> Result<()> {
        let mut store = lock_store(&self.store)?;
        if let Some(session) = store.session()? {
            info!("Session ended for {}", session.user_id);
        }
        store.end_session()?;
        Ok(())
    }
}

/// The active session, provided the store holds nobody else's rows
pub(crate) fn require_owner(store: &LocalStore) -> Result<Session> {
    let session = store.session()?.ok_or(Error::NoSession)?;
    let found = check(store, &session.user_id)?;
    match found.existing_owner_label {
        Some(label) => Err(Error::Conflict {
            existing_owner: label,
        }),
        None => Ok(session),
    }
}

fn check(store: &LocalStore, candidate_user_id: &str) -> Result<ConflictCheck> {
    let owners = store.foreign_owners(candidate_user_id)?;
    if owners.is_empty() {
        return Ok(ConflictCheck::none());
    }

    let stored = store.session()?;
    let label = owners
        .iter()
        .map(|owner| match &stored {
            Some(session) if &session.user_id == owner => {
                format!("{} ({})", owner, session.role)
            }
            _ => owner.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ");

    Ok(ConflictCheck {
        has_conflict: true,
        existing_owner_label: Some(label),
    })
}
