//! Local reads and writes
//!
//! `put` and `delete` stamp a fresh local entry onto the identity's history.
//! On a conflicted identity they act as a resolution: the new history is the
//! merge of every candidate plus the fresh entry, so it dominates them all.

use super::{DocState, Storage, Tombstone};
use crate::history::History;
use crate::storage::conflicts::Conflict;
use crate::types::{Body, CandidateId, Content, Document, DocumentId, Version, now_millis};
use crate::{Error, Result};
use std::collections::BTreeSet;

/// Outcome of a local read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Document),
    Conflict(Conflict),
    NotFound,
}

impl Lookup {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Lookup::Conflict(_))
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            Lookup::Found(doc) => Some(doc),
            _ => None,
        }
    }

    /// Convert into a plain result, turning the conflict signal into an error
    pub fn into_result(self, identity: &DocumentId) -> Result<Document> {
        match self {
            Lookup::Found(doc) => Ok(doc),
            Lookup::Conflict(conflict) => Err(conflict.into_error()),
            Lookup::NotFound => Err(Error::NotFound(identity.to_string())),
        }
    }
}

impl Document {
    pub fn to_version(&self) -> Version {
        Version {
            origin: self.origin,
            history: self.history.clone(),
            body: Body::Document(self.content.clone()),
            last_modified: self.last_modified,
        }
    }
}

/// Reject identities that cannot be stored or would shadow candidate ids
pub(crate) fn validate_identity(identity: &DocumentId) -> Result<()> {
    if identity.as_str().is_empty() {
        return Err(Error::InvalidIdentity("identity must not be empty".to_string()));
    }
    if CandidateId::parse(identity.as_str()).is_some() {
        return Err(Error::InvalidIdentity(format!(
            "'{}' is a conflict candidate id",
            identity
        )));
    }
    Ok(())
}

impl Storage {
    /// Read a document; a conflicted identity yields the conflict signal
    pub fn get(&self, identity: &DocumentId) -> Result<Lookup> {
        let _guard = self.lock(identity);
        Ok(match self.load_state(identity)? {
            DocState::Live(doc) => Lookup::Found(doc),
            DocState::Conflicted(set) => Lookup::Conflict(set.to_conflict()),
            DocState::Deleted(_) | DocState::Missing => Lookup::NotFound,
        })
    }

    /// Current history of an identity, including tombstoned ones
    pub fn history(&self, identity: &DocumentId) -> Result<Option<History>> {
        let _guard = self.lock(identity);
        Ok(match self.load_state(identity)? {
            DocState::Missing => None,
            state => Some(state.history()),
        })
    }

    /// Write a document, resolving any active conflict
    pub fn put(&self, identity: &DocumentId, content: Content) -> Result<History> {
        validate_identity(identity)?;
        let _guard = self.lock(identity);

        let prior = self.load_state(identity)?;
        let (seq, history) = self.tracker().record_local_write(&prior.history());
        let next = DocState::Live(Document {
            identity: identity.clone(),
            content,
            etag: seq.value(),
            origin: self.node_id(),
            history: history.clone(),
            last_modified: now_millis(),
        });

        if let DocState::Conflicted(set) = &prior {
            tracing::info!(
                identity = %identity,
                candidates = set.candidates.len(),
                "Conflict resolved by overwrite"
            );
        }

        self.commit(identity, &prior, &next, seq)?;
        tracing::debug!(identity = %identity, history = %history, "Document written");
        Ok(history)
    }

    /// Delete a document, resolving any active conflict
    ///
    /// Deleting an identity that does not exist or is already deleted is a no-op.
    pub fn delete(&self, identity: &DocumentId) -> Result<()> {
        validate_identity(identity)?;
        let _guard = self.lock(identity);

        let prior = self.load_state(identity)?;
        if matches!(prior, DocState::Missing | DocState::Deleted(_)) {
            return Ok(());
        }

        let (seq, history) = self.tracker().record_local_write(&prior.history());
        let now = now_millis();
        let next = DocState::Deleted(Tombstone {
            identity: identity.clone(),
            deleted_by: self.node_id(),
            etag: seq.value(),
            history: history.clone(),
            deleted_at: now,
            created_at: now,
            acked_by: BTreeSet::new(),
        });

        if let DocState::Conflicted(set) = &prior {
            tracing::info!(
                identity = %identity,
                candidates = set.candidates.len(),
                "Conflict resolved by delete"
            );
        }

        self.commit(identity, &prior, &next, seq)?;
        tracing::debug!(identity = %identity, history = %history, "Document deleted");
        Ok(())
    }
}
