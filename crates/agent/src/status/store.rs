//! Store — keyed by instance-or-checkpoint ID, merge-on-update, snapshot
//! reads.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::model::StatusRecord;

/// Multi-writer, multi-reader store behind a single mutex. All operations
/// are short; `view` hands out an independent copy so the reconciler can
/// iterate while other tasks keep writing.
#[derive(Default)]
pub struct StatusStore {
    entries: Mutex<HashMap<String, StatusRecord>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `record` into the entry for `id`, creating it if absent.
    /// Present fields overwrite; absent fields leave the stored value alone.
    pub fn update(&self, id: &str, record: StatusRecord) {
        let mut entries = self.entries.lock();
        entries
            .entry(id.to_string())
            .or_default()
            .merge_from(&record);
    }

    pub fn get(&self, id: &str) -> Option<StatusRecord> {
        self.entries.lock().get(id).cloned()
    }

    pub fn delete(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Independent snapshot of the whole store.
    pub fn view(&self) -> HashMap<String, StatusRecord> {
        self.entries.lock().clone()
    }
}
