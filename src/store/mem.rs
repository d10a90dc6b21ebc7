// Copyright 2024 Notarizer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{HistoryRecord, HistoryStore, SettingsStore};

#[derive(Default)]
struct HistoryState {
    records: HashMap<String, HistoryRecord>,
    /// Insertion order of record ids, oldest first.
    order: Vec<String>,
}

/// InMemoryStore is a store backed by plain in-memory maps.
///
/// Nothing survives a restart; used in tests and with the `--tmp` flag.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    settings: Arc<RwLock<HashMap<String, String>>>,
    history: Arc<RwLock<HistoryState>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl SettingsStore for InMemoryStore {
    #[tracing::instrument(skip(self))]
    fn get_setting(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.settings.read().get(key).cloned())
    }

    #[tracing::instrument(skip(self))]
    fn set_setting(&self, key: &str, value: &str) -> crate::Result<()> {
        self.settings
            .write()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

impl HistoryStore for InMemoryStore {
    #[tracing::instrument(skip(self, record), fields(id = %record.id))]
    fn append_record(&self, record: HistoryRecord) -> crate::Result<()> {
        let mut state = self.history.write();
        if !state.records.contains_key(&record.id) {
            state.order.push(record.id.clone());
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove_record(
        &self,
        id: &str,
    ) -> crate::Result<Option<HistoryRecord>> {
        let mut state = self.history.write();
        let removed = state.records.remove(id);
        if removed.is_some() {
            state.order.retain(|existing| existing != id);
        }
        Ok(removed)
    }

    fn get_record(&self, id: &str) -> crate::Result<Option<HistoryRecord>> {
        Ok(self.history.read().records.get(id).cloned())
    }

    fn list_records(&self) -> crate::Result<Vec<HistoryRecord>> {
        let state = self.history.read();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NotarizeStatus;

    fn record(id: &str, proof: &str, ts: u64) -> HistoryRecord {
        HistoryRecord {
            id: id.to_owned(),
            status: NotarizeStatus::Success,
            proof: Some(proof.to_owned()),
            timestamp_ms: ts,
            url: "https://x.com/home".to_owned(),
            method: "GET".to_owned(),
        }
    }

    #[test]
    fn append_preserves_insertion_order() {
        let store = InMemoryStore::default();
        store.append_record(record("a", "p1", 1)).unwrap();
        store.append_record(record("b", "p2", 2)).unwrap();
        store.append_record(record("c", "p3", 3)).unwrap();
        let ids: Vec<_> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn reappend_replaces_in_place() {
        let store = InMemoryStore::default();
        store.append_record(record("a", "p1", 1)).unwrap();
        store.append_record(record("b", "p2", 2)).unwrap();
        // re-appending "a" replaces the payload but keeps its position.
        store.append_record(record("a", "p1-new", 3)).unwrap();
        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].proof.as_deref(), Some("p1-new"));
        assert_eq!(records[1].id, "b");
    }

    #[test]
    fn remove_returns_the_record() {
        let store = InMemoryStore::default();
        store.append_record(record("a", "p1", 1)).unwrap();
        let removed = store.remove_record("a").unwrap().unwrap();
        assert_eq!(removed.id, "a");
        assert!(store.remove_record("a").unwrap().is_none());
        assert!(store.list_records().unwrap().is_empty());
    }

    #[test]
    fn settings_round_trip_and_defaults() {
        let store = InMemoryStore::default();
        assert_eq!(store.max_sent_data().unwrap(), 4096);
        assert_eq!(store.max_recv_data().unwrap(), 16384);
        assert_eq!(store.notary_api().unwrap(), "http://0.0.0.0:7047");
        store
            .set_setting(crate::store::MAX_SENT_KEY, "2048")
            .unwrap();
        assert_eq!(store.max_sent_data().unwrap(), 2048);
    }

    #[test]
    fn malformed_list_falls_back_to_empty() {
        let store = InMemoryStore::default();
        store.set_setting("url-patterns", "not json").unwrap();
        assert!(store.get_list("url-patterns").unwrap().is_empty());
        store
            .set_list("url-patterns", &["a".to_owned(), "b".to_owned()])
            .unwrap();
        assert_eq!(store.get_list("url-patterns").unwrap(), ["a", "b"]);
    }
}
