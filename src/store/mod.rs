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

//! # Notarizer Store Module
//!
//! A module for managing the storage of the notarizer.
//!
//! ## Overview
//!
//! The store module persists two concerns behind traits: user settings
//! (string key/value pairs with JSON list helpers and typed accessors) and
//! the ordered history of completed notarizations.

use serde::{Deserialize, Serialize};

/// A module for managing in-memory storage of the notarizer.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
pub mod sled;

/// A store that uses in memory data structures as the backend.
pub use mem::InMemoryStore;
/// A store that uses [`sled`](https://sled.rs) as the backend.
pub use self::sled::SledStore;

/// Settings key for the notary API endpoint.
pub const NOTARY_API_KEY: &str = "notary-api";
/// Settings key for the websocket proxy endpoint.
pub const PROXY_API_KEY: &str = "proxy-api";
/// Settings key for the max sent transcript bytes.
pub const MAX_SENT_KEY: &str = "max-sent";
/// Settings key for the max received transcript bytes.
pub const MAX_RECEIVED_KEY: &str = "max-received";
/// Settings key for the logging filter level.
pub const LOGGING_FILTER_KEY: &str = "logging-filter";
/// Settings key for the persisted URL pattern list.
pub const URL_PATTERNS_KEY: &str = "url-patterns";

/// Default notary API endpoint.
pub const DEFAULT_NOTARY_API: &str = "http://0.0.0.0:7047";
/// Default websocket proxy endpoint.
pub const DEFAULT_PROXY_API: &str = "wss://notary.pse.dev/proxy";
/// Default maximum bytes of sent data covered by a transcript.
pub const DEFAULT_MAX_SENT: u64 = 4096;
/// Default maximum bytes of received data covered by a transcript.
pub const DEFAULT_MAX_RECEIVED: u64 = 16384;
/// Default logging filter level.
pub const DEFAULT_LOGGING_FILTER: &str = "info";

/// Terminal outcome of a notarization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotarizeStatus {
    Success,
    Failure,
}

/// One completed notarization, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// The request id this record belongs to.
    pub id: String,
    pub status: NotarizeStatus,
    /// The proof artifact produced by the notary. Opaque to this crate.
    #[serde(default)]
    pub proof: Option<String>,
    /// Completion time, milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// Originating request metadata.
    pub url: String,
    pub method: String,
}

/// SettingsStore is a simple trait for persisting string settings with
/// typed, defaulted accessors on top.
pub trait SettingsStore: Clone + Send + Sync {
    /// Get the raw string value for a key, if set.
    fn get_setting(&self, key: &str) -> crate::Result<Option<String>>;
    /// Set the raw string value for a key.
    fn set_setting(&self, key: &str, value: &str) -> crate::Result<()>;

    /// Get a string value, falling back to `default` when unset.
    fn get_setting_or(
        &self,
        key: &str,
        default: &str,
    ) -> crate::Result<String> {
        Ok(self.get_setting(key)?.unwrap_or_else(|| default.to_owned()))
    }

    /// Get a JSON-encoded string list.
    ///
    /// A missing or malformed value falls back to the empty list; parse
    /// failures are recovered locally, never surfaced.
    fn get_list(&self, key: &str) -> crate::Result<Vec<String>> {
        let raw = match self.get_setting(key)? {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(list),
            Err(e) => {
                tracing::warn!(key, error = %e, "malformed list value, using default");
                Ok(Vec::new())
            }
        }
    }

    /// Store a string list as JSON.
    fn set_list(&self, key: &str, items: &[String]) -> crate::Result<()> {
        self.set_setting(key, &serde_json::to_string(items)?)
    }

    /// Maximum bytes of sent data covered by a transcript.
    fn max_sent_data(&self) -> crate::Result<u64> {
        let raw = self.get_setting(MAX_SENT_KEY)?;
        Ok(raw
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SENT))
    }

    /// Maximum bytes of received data covered by a transcript.
    fn max_recv_data(&self) -> crate::Result<u64> {
        let raw = self.get_setting(MAX_RECEIVED_KEY)?;
        Ok(raw
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RECEIVED))
    }

    /// The notary API endpoint.
    fn notary_api(&self) -> crate::Result<String> {
        self.get_setting_or(NOTARY_API_KEY, DEFAULT_NOTARY_API)
    }

    /// The websocket proxy endpoint.
    fn proxy_api(&self) -> crate::Result<String> {
        self.get_setting_or(PROXY_API_KEY, DEFAULT_PROXY_API)
    }

    /// The logging filter level.
    fn logging_filter(&self) -> crate::Result<String> {
        self.get_setting_or(LOGGING_FILTER_KEY, DEFAULT_LOGGING_FILTER)
    }
}

/// HistoryStore is a simple trait for storing and retrieving the ordered
/// history of completed notarizations.
///
/// Appends are idempotent upserts: a record whose id already exists
/// replaces the stored record in place but keeps its original position in
/// insertion order.
pub trait HistoryStore: Clone + Send + Sync {
    /// Append a record, or replace it in place if its id already exists.
    fn append_record(&self, record: HistoryRecord) -> crate::Result<()>;
    /// Delete a record by id. Returns the removed record, `None` if absent.
    fn remove_record(
        &self,
        id: &str,
    ) -> crate::Result<Option<HistoryRecord>>;
    /// Get a single record by id.
    fn get_record(&self, id: &str) -> crate::Result<Option<HistoryRecord>>;
    /// All records, insertion order, oldest first.
    fn list_records(&self) -> crate::Result<Vec<HistoryRecord>>;

    /// True if a record with this id exists.
    fn contains_record(&self, id: &str) -> crate::Result<bool> {
        Ok(self.get_record(id)?.is_some())
    }
}
