//! Conflict sets
//!
//! A conflict set holds every causally unordered version of one identity until
//! something resolves it: a local put or delete, or a replicated write whose
//! history dominates all candidates.

use super::{decode, DocState, Storage};
use crate::history::History;
use crate::storage::kv::Column;
use crate::types::{CandidateId, Content, DocumentId, Version};
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use std::fmt;

const SCAN_PAGE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ConflictSet {
    #[n(0)]
    pub identity: DocumentId,

    /// Local sequence of the last change to the set
    #[n(1)]
    pub etag: u64,

    /// Mutually concurrent versions, in arrival order
    #[n(2)]
    pub candidates: Vec<Version>,

    /// Unix milliseconds when the conflict was first detected here
    #[n(3)]
    pub created_at: u64,
}

impl ConflictSet {
    pub fn candidate_ids(&self) -> Vec<CandidateId> {
        self.candidates
            .iter()
            .map(|c| CandidateId::new(&self.identity, &c.history))
            .collect()
    }

    /// Entry-wise maximum over every candidate's history
    pub fn merged_history(&self) -> History {
        let mut merged = History::new();
        for candidate in &self.candidates {
            merged.merge(&candidate.history);
        }
        merged
    }

    pub fn candidate(&self, id: &CandidateId) -> Option<&Version> {
        self.candidates
            .iter()
            .find(|c| &CandidateId::new(&self.identity, &c.history) == id)
    }

    pub fn to_conflict(&self) -> Conflict {
        Conflict {
            identity: self.identity.clone(),
            candidates: self.candidate_ids(),
        }
    }
}

/// Conflict signal returned by reads of a conflicted identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub identity: DocumentId,
    pub candidates: Vec<CandidateId>,
}

impl Conflict {
    pub fn into_error(self) -> Error {
        Error::Conflict {
            identity: self.identity,
            candidates: self.candidates,
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conflict detected on {}, conflict must be resolved before the document will be accessible",
            self.identity
        )
    }
}

impl Storage {
    /// Fetch one candidate of an active conflict
    ///
    /// Returns `None` once the conflict has been resolved.
    pub fn get_candidate(&self, candidate_id: &str) -> Result<Option<Version>> {
        let Some((identity, _)) = CandidateId::parse(candidate_id) else {
            return Ok(None);
        };
        let id = CandidateId(candidate_id.to_string());

        let _guard = self.lock(&identity);
        match self.load_state(&identity)? {
            DocState::Conflicted(set) => Ok(set.candidate(&id).cloned()),
            _ => Ok(None),
        }
    }

    /// Every conflicted identity with its candidate ids
    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        let mut start = Vec::new();
        loop {
            let page = self.kv().scan(Column::Conflicts, &start, SCAN_PAGE)?;
            let done = page.len() < SCAN_PAGE;
            for (key, value) in page {
                let set: ConflictSet = decode(&value)?;
                conflicts.push(set.to_conflict());
                start = key;
                start.push(0);
            }
            if done {
                break;
            }
        }
        Ok(conflicts)
    }

    /// Resolve by writing a tombstone that dominates every candidate
    pub fn resolve_by_delete(&self, identity: &DocumentId) -> Result<()> {
        self.delete(identity)
    }

    /// Resolve by writing `content` with a history that dominates every candidate
    pub fn resolve_by_overwrite(&self, identity: &DocumentId, content: Content) -> Result<History> {
        self.put(identity, content)
    }
}
