//! Short-lived cache of partially captured web requests.
//!
//! Browser-side network events arrive in phases (headers sent, body
//! available, response started) and may race for the same request id, so
//! writes are merges: each phase fills in its own fields and never regresses
//! a field another phase already set. Entries expire after a TTL and the
//! cache is bounded, evicting oldest-first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// An ordered HTTP header name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything captured so far about a single network transaction.
///
/// Mutable until it is dequeued for notarization; after that the queue and
/// the history store only ever see copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    /// Unique id of the network transaction.
    pub request_id: String,
    /// The tab that owns this request, used for per-tab cleanup.
    #[serde(default)]
    pub tab_id: i64,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub initiator: Option<String>,
    /// Ordered request headers as they were sent on the wire.
    #[serde(default)]
    pub request_headers: Vec<Header>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub form_data: Option<BTreeMap<String, Vec<String>>>,
    /// Set once the response phase has been observed.
    #[serde(default)]
    pub response_headers: Option<Vec<Header>>,
}

/// A partial update for one capture phase.
///
/// Only `Some` and non-empty fields are applied, which is what makes merges
/// of distinct phases commutative: a later phase can never blank out a field
/// an earlier phase set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPatch {
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub request_headers: Option<Vec<Header>>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub form_data: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub response_headers: Option<Vec<Header>>,
}

impl CapturedRequest {
    /// Merges a partial phase update into this entry, last-write-wins per
    /// field, skipping empty values.
    pub fn merge(&mut self, patch: RequestPatch) {
        if let Some(tab_id) = patch.tab_id {
            self.tab_id = tab_id;
        }
        if let Some(url) = patch.url.filter(|v| !v.is_empty()) {
            self.url = url;
        }
        if let Some(method) = patch.method.filter(|v| !v.is_empty()) {
            self.method = method;
        }
        if let Some(initiator) = patch.initiator.filter(|v| !v.is_empty()) {
            self.initiator = Some(initiator);
        }
        if let Some(headers) = patch.request_headers.filter(|v| !v.is_empty())
        {
            self.request_headers = headers;
        }
        if let Some(body) = patch.request_body.filter(|v| !v.is_empty()) {
            self.request_body = Some(body);
        }
        if let Some(form) = patch.form_data.filter(|v| !v.is_empty()) {
            self.form_data = Some(form);
        }
        if let Some(headers) =
            patch.response_headers.filter(|v| !v.is_empty())
        {
            self.response_headers = Some(headers);
        }
    }
}

struct Slot {
    request: CapturedRequest,
    expires_at_ms: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    /// Insertion order, oldest first. May contain ids whose entry has
    /// already been removed; those are skipped on eviction.
    order: VecDeque<String>,
}

/// TTL-bound, size-bounded cache of [`CapturedRequest`] entries.
///
/// All mutation goes through one mutex scoped to this instance so
/// read-modify-write merges from racing capture handlers are atomic with
/// respect to each other.
pub struct RequestCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache").finish()
    }
}

impl RequestCache {
    pub fn new(
        ttl: Duration,
        max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            max_entries,
            clock,
        }
    }

    /// Merges `patch` into the entry for `request_id`, creating it if
    /// absent. Each write resets the entry TTL. If the cache is over
    /// capacity afterwards, the oldest entry is evicted.
    pub fn put(&self, request_id: &str, patch: RequestPatch) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        Self::evict_expired_locked(&mut inner, now);
        let expires_at_ms = now + self.ttl.as_millis() as u64;
        match inner.entries.get_mut(request_id) {
            Some(slot) => {
                slot.request.merge(patch);
                slot.expires_at_ms = expires_at_ms;
            }
            None => {
                let mut request = CapturedRequest {
                    request_id: request_id.to_owned(),
                    ..Default::default()
                };
                request.merge(patch);
                inner.entries.insert(
                    request_id.to_owned(),
                    Slot {
                        request,
                        expires_at_ms,
                    },
                );
                inner.order.push_back(request_id.to_owned());
            }
        }
        while inner.entries.len() > self.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    if inner.entries.remove(&oldest).is_some() {
                        tracing::trace!(
                            request_id = %oldest,
                            "evicted oldest capture entry (cache full)"
                        );
                    }
                }
                None => break,
            }
        }
    }

    /// Returns a copy of the captured request, if present and not expired.
    pub fn get(&self, request_id: &str) -> Option<CapturedRequest> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(request_id) {
            Some(slot) if slot.expires_at_ms > now => {
                return Some(slot.request.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(request_id);
        }
        None
    }

    /// Drops all entries older than the TTL.
    pub fn evict_expired(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        Self::evict_expired_locked(&mut inner, now);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Drops all entries owned by the given tab. Called when a tab closes.
    pub fn clear_for_tab(&self, tab_id: i64) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|_, slot| slot.request.tab_id != tab_id);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired_locked(inner: &mut Inner, now: u64) {
        inner.entries.retain(|_, slot| slot.expires_at_ms > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_clock(
        ttl_secs: u64,
        max_entries: usize,
    ) -> (RequestCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let cache = RequestCache::new(
            Duration::from_secs(ttl_secs),
            max_entries,
            clock.clone(),
        );
        (cache, clock)
    }

    fn headers_patch() -> RequestPatch {
        RequestPatch {
            tab_id: Some(7),
            url: Some("https://x.com/i/api/1.1/dm/user_updates.json".into()),
            method: Some("GET".into()),
            request_headers: Some(vec![Header::new("Cookie", "auth=1")]),
            ..Default::default()
        }
    }

    fn body_patch() -> RequestPatch {
        RequestPatch {
            request_body: Some("{\"q\":1}".into()),
            ..Default::default()
        }
    }

    fn response_patch() -> RequestPatch {
        RequestPatch {
            response_headers: Some(vec![Header::new(
                "content-type",
                "application/json",
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn merge_is_order_independent() {
        let patches =
            [headers_patch(), body_patch(), response_patch()];
        // all 6 permutations of the three phases must converge.
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut results = Vec::new();
        for order in orders {
            let (cache, _) = cache_with_clock(300, 100);
            for i in order {
                cache.put("r1", patches[i].clone());
            }
            results.push(cache.get("r1").unwrap());
        }
        for w in results.windows(2) {
            assert_eq!(w[0], w[1]);
        }
        let merged = &results[0];
        assert_eq!(merged.method, "GET");
        assert_eq!(merged.request_body.as_deref(), Some("{\"q\":1}"));
        assert!(merged.response_headers.is_some());
    }

    #[test]
    fn set_fields_never_regress_to_empty() {
        let (cache, _) = cache_with_clock(300, 100);
        cache.put("r1", headers_patch());
        cache.put(
            "r1",
            RequestPatch {
                method: Some(String::new()),
                request_headers: Some(vec![]),
                ..Default::default()
            },
        );
        let entry = cache.get("r1").unwrap();
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.request_headers.len(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache_with_clock(300, 100);
        cache.put("r1", headers_patch());
        clock.advance(299_999);
        assert!(cache.get("r1").is_some());
        clock.advance(2);
        assert!(cache.get("r1").is_none());
    }

    #[test]
    fn put_resets_ttl() {
        let (cache, clock) = cache_with_clock(300, 100);
        cache.put("r1", headers_patch());
        clock.advance(200_000);
        cache.put("r1", body_patch());
        clock.advance(200_000);
        // 400s after creation but only 200s after the last write.
        assert!(cache.get("r1").is_some());
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let (cache, _) = cache_with_clock(300, 2);
        cache.put("r1", headers_patch());
        cache.put("r2", headers_patch());
        cache.put("r3", headers_patch());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("r1").is_none());
        assert!(cache.get("r2").is_some());
        assert!(cache.get("r3").is_some());
    }

    #[test]
    fn clear_for_tab_only_drops_that_tab() {
        let (cache, _) = cache_with_clock(300, 100);
        cache.put("r1", headers_patch()); // tab 7
        cache.put(
            "r2",
            RequestPatch {
                tab_id: Some(9),
                url: Some("https://example.com".into()),
                ..Default::default()
            },
        );
        cache.clear_for_tab(7);
        assert!(cache.get("r1").is_none());
        assert!(cache.get("r2").is_some());
    }
}
