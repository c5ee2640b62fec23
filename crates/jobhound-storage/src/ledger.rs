use std::collections::HashSet;
use std::sync::Arc;

use jobhound_core::JOB_ID_HEX_LEN;
use sha2::{Digest, Sha256};

/// Content-derived identity for feed and API records.
///
/// Only the first [`JOB_ID_HEX_LEN`] hex characters are kept, so collisions are possible
/// but unlikely at the volumes a single store sees. A title edited at the origin yields a
/// different id, and the posting is ingested again.
pub fn job_id_for(source_name: &str, title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source_name}_{title}_{link}").as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(JOB_ID_HEX_LEN);
    id
}

/// Run-scoped set of ingested `job_id`s.
///
/// Only the persistence sink inserts, and only after a record has been written.
/// Fetch tasks get a [`LedgerView`] instead.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    seen: Arc<HashSet<String>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seen: Arc::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.seen.contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Read-only snapshot for concurrent fetch tasks.
    pub fn view(&self) -> LedgerView {
        LedgerView {
            seen: Arc::clone(&self.seen),
        }
    }

    // Copy-on-write: views held by lingering tasks keep the old snapshot.
    pub(crate) fn insert(&mut self, job_id: String) -> bool {
        Arc::make_mut(&mut self.seen).insert(job_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerView {
    seen: Arc<HashSet<String>>,
}

impl LedgerView {
    pub fn contains(&self, job_id: &str) -> bool {
        self.seen.contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_deterministic_and_fixed_length() {
        let a = job_id_for("We Work Remotely", "Rust Engineer", "https://example.com/jobs/1");
        let b = job_id_for("We Work Remotely", "Rust Engineer", "https://example.com/jobs/1");
        assert_eq!(a, b);
        assert_eq!(a.len(), JOB_ID_HEX_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn job_id_changes_with_any_component() {
        let base = job_id_for("board", "title", "https://example.com/1");
        assert_ne!(base, job_id_for("other-board", "title", "https://example.com/1"));
        assert_ne!(base, job_id_for("board", "title (edited)", "https://example.com/1"));
        assert_ne!(base, job_id_for("board", "title", "https://example.com/2"));
    }

    #[test]
    fn views_are_snapshots() {
        let mut ledger = Ledger::from_ids(["a"]);
        let view = ledger.view();
        assert!(ledger.insert("b".to_string()));
        assert!(!ledger.insert("b".to_string()));

        assert!(ledger.contains("b"));
        assert!(view.contains("a"));
        assert!(!view.contains("b"));
        assert_eq!(ledger.view().len(), 2);
    }
}
