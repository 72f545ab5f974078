//! Change log reads for replication senders

use super::{decode_seq, Storage};
use crate::storage::kv::Column;
use crate::types::{DocumentId, Version};
use crate::Result;

/// Latest state of one identity at a change-log position
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub seq: u64,
    pub identity: DocumentId,
    /// One version for a document or tombstone, every candidate for a conflict
    pub versions: Vec<Version>,
}

impl Storage {
    /// Up to `limit` changes with `after < seq <= watermark`, in sequence order
    pub fn changes_since(&self, after: u64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let watermark = self.watermark();
        if after >= watermark || limit == 0 {
            return Ok(Vec::new());
        }

        let start = (after + 1).to_be_bytes();
        let mut entries = Vec::new();
        for (key, value) in self.kv().scan(Column::Changes, &start, limit)? {
            let seq = decode_seq(&key)?;
            if seq > watermark {
                break;
            }
            let identity = DocumentId::new(String::from_utf8_lossy(&value).into_owned());

            let _guard = self.lock(&identity);
            let state = self.load_state(&identity)?;
            // Moved to a later sequence after the scan; shipped from there.
            if state.etag() != Some(seq) {
                continue;
            }
            entries.push(ChangeEntry {
                seq,
                identity,
                versions: state.versions(),
            });
        }
        Ok(entries)
    }
}
