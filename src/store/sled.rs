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

use std::path::Path;

use super::{HistoryRecord, HistoryStore, SettingsStore};

const LAST_IDX_KEY: &[u8] = b"last_idx";
const IDX_PREFIX: &[u8] = b"idx_";

/// SledStore is a store backed by a [sled](https://sled.rs) database.
///
/// Settings live in one tree; history records live in an id-keyed tree
/// with a companion order tree mapping a monotonic index to each id, which
/// is what preserves insertion order across restarts.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Open the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .use_compression(true)
            .open()?;
        Ok(Self { db })
    }

    /// Open a temporary database that is deleted on drop.
    pub fn temporary() -> crate::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn settings_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree("settings")?)
    }

    fn history_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree("history")?)
    }

    fn order_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree("history_order")?)
    }

    fn next_idx(order: &sled::Tree) -> crate::Result<u64> {
        let idx = order
            .get(LAST_IDX_KEY)?
            .map(|v| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&v);
                u64::from_be_bytes(bytes) + 1
            })
            .unwrap_or(0);
        order.insert(LAST_IDX_KEY, &idx.to_be_bytes())?;
        Ok(idx)
    }

    fn idx_key(idx: u64) -> Vec<u8> {
        let mut key = IDX_PREFIX.to_vec();
        key.extend_from_slice(&idx.to_be_bytes());
        key
    }
}

impl SettingsStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn get_setting(&self, key: &str) -> crate::Result<Option<String>> {
        let tree = self.settings_tree()?;
        let value = tree
            .get(key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned());
        Ok(value)
    }

    #[tracing::instrument(skip(self))]
    fn set_setting(&self, key: &str, value: &str) -> crate::Result<()> {
        let tree = self.settings_tree()?;
        tree.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}

impl HistoryStore for SledStore {
    #[tracing::instrument(skip(self, record), fields(id = %record.id))]
    fn append_record(&self, record: HistoryRecord) -> crate::Result<()> {
        let history = self.history_tree()?;
        let order = self.order_tree()?;
        let payload = serde_json::to_vec(&record)?;
        // replacing an existing id keeps its slot in the order tree.
        if history.get(record.id.as_bytes())?.is_none() {
            let idx = Self::next_idx(&order)?;
            order.insert(Self::idx_key(idx), record.id.as_bytes())?;
        }
        history.insert(record.id.as_bytes(), payload)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove_record(
        &self,
        id: &str,
    ) -> crate::Result<Option<HistoryRecord>> {
        let history = self.history_tree()?;
        let removed = match history.remove(id.as_bytes())? {
            Some(v) => Some(serde_json::from_slice(&v)?),
            None => return Ok(None),
        };
        let order = self.order_tree()?;
        for kv in order.scan_prefix(IDX_PREFIX) {
            let (key, value) = kv?;
            if value.as_ref() == id.as_bytes() {
                order.remove(key)?;
                break;
            }
        }
        Ok(removed)
    }

    fn get_record(&self, id: &str) -> crate::Result<Option<HistoryRecord>> {
        let history = self.history_tree()?;
        match history.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn list_records(&self) -> crate::Result<Vec<HistoryRecord>> {
        let history = self.history_tree()?;
        let order = self.order_tree()?;
        let mut records = Vec::new();
        for kv in order.scan_prefix(IDX_PREFIX) {
            let (_, id) = kv?;
            if let Some(v) = history.get(&id)? {
                records.push(serde_json::from_slice(&v)?);
            }
        }
        Ok(records)
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
    fn history_survives_ordering_across_many_records() {
        let tmp = tempfile::tempdir().expect("should create tmp dir");
        let store =
            SledStore::open(tmp.path()).expect("should open the sled db");
        for i in 0..20 {
            store
                .append_record(record(&format!("r{i}"), "p", i))
                .unwrap();
        }
        let ids: Vec<_> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let expected: Vec<_> =
            (0..20).map(|i| format!("r{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn reappend_replaces_in_place() {
        let tmp = tempfile::tempdir().expect("should create tmp dir");
        let store =
            SledStore::open(tmp.path()).expect("should open the sled db");
        store.append_record(record("a", "p1", 1)).unwrap();
        store.append_record(record("b", "p2", 2)).unwrap();
        store.append_record(record("a", "p1-new", 3)).unwrap();
        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].proof.as_deref(), Some("p1-new"));
    }

    #[test]
    fn remove_drops_record_and_order_slot() {
        let tmp = tempfile::tempdir().expect("should create tmp dir");
        let store =
            SledStore::open(tmp.path()).expect("should open the sled db");
        store.append_record(record("a", "p1", 1)).unwrap();
        store.append_record(record("b", "p2", 2)).unwrap();
        let removed = store.remove_record("a").unwrap().unwrap();
        assert_eq!(removed.id, "a");
        let ids: Vec<_> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["b"]);
    }

    #[test]
    fn settings_round_trip() {
        let store =
            SledStore::temporary().expect("should open the sled db");
        assert!(store
            .get_setting(crate::store::NOTARY_API_KEY)
            .unwrap()
            .is_none());
        store
            .set_setting(crate::store::NOTARY_API_KEY, "http://localhost:7047")
            .unwrap();
        assert_eq!(
            store.notary_api().unwrap(),
            "http://localhost:7047"
        );
    }
}
