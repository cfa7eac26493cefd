// =============================================================================
// Feature store — retention-bounded per-pair/timeframe snapshot store
// =============================================================================
//
// Feature vectors are kept per (pair, timeframe) key in timestamp order with
// dual retention: at most `max_per_key` entries AND a TTL. Eviction is
// oldest-first; retention is enforced eagerly on write and via
// `purge_expired`, and lazily on read. The store exclusively owns the map;
// readers receive copies.
//
// Every vector carries a stable SHA-256 hash of its sorted-key JSON
// serialisation, used as the persistence dedup key. Persistence is
// fire-and-forget.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::persistence::PersistenceAdapter;
use crate::types::{now_ms, Pair, Timeframe};

/// Default retention bounds.
const DEFAULT_MAX_PER_KEY: usize = 500;
const DEFAULT_TTL_MS: i64 = 24 * 3600 * 1000;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A single feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl FeatureValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// A timestamped feature snapshot with derived convenience fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub ts: i64,
    /// BTreeMap keeps key order stable for hashing and serialisation.
    pub features: BTreeMap<String, FeatureValue>,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

impl FeatureVector {
    fn build(ts: i64, features: BTreeMap<String, FeatureValue>) -> Self {
        let hash = stable_hash(&features);
        let price = features.get("price").and_then(FeatureValue::as_number);
        let score = features.get("score").and_then(FeatureValue::as_number);
        let direction = features.get("direction").and_then(|v| match v {
            FeatureValue::Text(s) => Some(s.clone()),
            _ => None,
        });
        Self {
            ts,
            features,
            hash,
            price,
            score,
            direction,
        }
    }
}

/// SHA-256 of the sorted-key JSON serialisation.
fn stable_hash(features: &BTreeMap<String, FeatureValue>) -> String {
    let json = serde_json::to_string(features).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Per-key statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureKeyStats {
    pub pair: Pair,
    pub timeframe: Timeframe,
    pub count: usize,
    pub oldest_ts: i64,
    pub newest_ts: i64,
}

/// Store-wide summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStoreSummary {
    pub keys: usize,
    pub total_vectors: usize,
    pub max_per_key: usize,
    pub ttl_ms: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct FeatureStore {
    entries: RwLock<HashMap<(Pair, Timeframe), VecDeque<FeatureVector>>>,
    max_per_key: usize,
    ttl_ms: i64,
    persistence: Option<Arc<PersistenceAdapter>>,
}

impl FeatureStore {
    pub fn new(persistence: Option<Arc<PersistenceAdapter>>) -> Self {
        Self::with_retention(DEFAULT_MAX_PER_KEY, DEFAULT_TTL_MS, persistence)
    }

    pub fn with_retention(
        max_per_key: usize,
        ttl_ms: i64,
        persistence: Option<Arc<PersistenceAdapter>>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_per_key,
            ttl_ms,
            persistence,
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Record a feature snapshot stamped with the current time.
    pub fn record_features(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        features: BTreeMap<String, FeatureValue>,
    ) -> FeatureVector {
        self.record_features_at(pair, timeframe, features, now_ms())
    }

    /// Record a feature snapshot with an explicit timestamp. Entries are
    /// kept in ascending timestamp order regardless of arrival order.
    pub fn record_features_at(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        features: BTreeMap<String, FeatureValue>,
        ts: i64,
    ) -> FeatureVector {
        let vector = FeatureVector::build(ts, features);

        {
            let mut entries = self.entries.write();
            let ring = entries
                .entry((pair.clone(), timeframe))
                .or_insert_with(VecDeque::new);

            // Insert preserving ascending ts order; appends are the common
            // case so search from the back.
            let insert_at = ring
                .iter()
                .rposition(|v| v.ts <= vector.ts)
                .map(|i| i + 1)
                .unwrap_or(0);
            ring.insert(insert_at, vector.clone());

            // Eager retention: size bound then TTL, oldest first.
            while ring.len() > self.max_per_key {
                ring.pop_front();
            }
            let cutoff = vector.ts - self.ttl_ms;
            while ring.front().map(|v| v.ts < cutoff).unwrap_or(false) {
                ring.pop_front();
            }
        }

        // Fire-and-forget persistence.
        if let Some(persistence) = &self.persistence {
            let persistence = persistence.clone();
            let pair_str = pair.to_string();
            let tf_str = timeframe.to_string();
            let snapshot = vector.clone();
            tokio::spawn(async move {
                let payload =
                    serde_json::to_value(&snapshot.features).unwrap_or(serde_json::Value::Null);
                let _ = persistence.record_feature_snapshot(
                    &pair_str,
                    &tf_str,
                    &snapshot.hash,
                    &payload,
                    snapshot.ts,
                );
            });
        }

        debug!(pair = %pair, timeframe = %timeframe, ts = vector.ts, "features recorded");
        vector
    }

    /// Drop all entries older than the TTL across every key.
    pub fn purge_expired(&self) -> usize {
        let cutoff = now_ms() - self.ttl_ms;
        let mut removed = 0;
        let mut entries = self.entries.write();
        entries.retain(|_, ring| {
            while ring.front().map(|v| v.ts < cutoff).unwrap_or(false) {
                ring.pop_front();
                removed += 1;
            }
            !ring.is_empty()
        });
        if removed > 0 {
            debug!(removed, "expired feature vectors purged");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Reads (copy-on-return)
    // -------------------------------------------------------------------------

    /// Most recent vector for the key, if fresh.
    pub fn get_latest(&self, pair: &Pair, timeframe: Timeframe) -> Option<FeatureVector> {
        let cutoff = now_ms() - self.ttl_ms;
        let entries = self.entries.read();
        entries
            .get(&(pair.clone(), timeframe))
            .and_then(|ring| ring.back())
            .filter(|v| v.ts >= cutoff)
            .cloned()
    }

    /// Vectors with `ts >= since_ts`, capped at `limit`, oldest first.
    pub fn get_range(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        since_ts: i64,
        limit: usize,
    ) -> Vec<FeatureVector> {
        let cutoff = now_ms() - self.ttl_ms;
        let floor = since_ts.max(cutoff);
        let entries = self.entries.read();
        match entries.get(&(pair.clone(), timeframe)) {
            Some(ring) => ring
                .iter()
                .filter(|v| v.ts >= floor)
                .take(limit)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Latest vector per timeframe for one pair.
    pub fn get_snapshot(&self, pair: &Pair) -> HashMap<Timeframe, FeatureVector> {
        let cutoff = now_ms() - self.ttl_ms;
        let entries = self.entries.read();
        let mut out = HashMap::new();
        for ((p, tf), ring) in entries.iter() {
            if p == pair {
                if let Some(latest) = ring.back().filter(|v| v.ts >= cutoff) {
                    out.insert(*tf, latest.clone());
                }
            }
        }
        out
    }

    /// Per-key statistics, newest keys first, capped at `limit`.
    pub fn get_stats(&self, limit: usize) -> Vec<FeatureKeyStats> {
        let entries = self.entries.read();
        let mut stats: Vec<FeatureKeyStats> = entries
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|((pair, tf), ring)| FeatureKeyStats {
                pair: pair.clone(),
                timeframe: *tf,
                count: ring.len(),
                oldest_ts: ring.front().map(|v| v.ts).unwrap_or(0),
                newest_ts: ring.back().map(|v| v.ts).unwrap_or(0),
            })
            .collect();
        stats.sort_by(|a, b| b.newest_ts.cmp(&a.newest_ts));
        stats.truncate(limit);
        stats
    }

    /// Store-wide summary.
    pub fn snapshot_summary(&self) -> FeatureStoreSummary {
        let entries = self.entries.read();
        FeatureStoreSummary {
            keys: entries.len(),
            total_vectors: entries.values().map(VecDeque::len).sum(),
            max_per_key: self.max_per_key,
            ttl_ms: self.ttl_ms,
        }
    }
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let summary = self.snapshot_summary();
        f.debug_struct("FeatureStore")
            .field("keys", &summary.keys)
            .field("total_vectors", &summary.total_vectors)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    fn features(price: f64, score: f64) -> BTreeMap<String, FeatureValue> {
        let mut map = BTreeMap::new();
        map.insert("price".to_string(), price.into());
        map.insert("score".to_string(), score.into());
        map.insert("direction".to_string(), "BUY".into());
        map.insert("fresh".to_string(), true.into());
        map
    }

    // Invariant 1: get_latest(k).ts equals the max recorded ts.
    #[test]
    fn latest_is_max_ts() {
        let store = FeatureStore::new(None);
        let pair = eurusd();
        let now = now_ms();

        store.record_features_at(&pair, Timeframe::M15, features(1.08, 10.0), now - 3000);
        store.record_features_at(&pair, Timeframe::M15, features(1.09, 20.0), now - 1000);
        // Out-of-order arrival still lands in ts order.
        store.record_features_at(&pair, Timeframe::M15, features(1.085, 15.0), now - 2000);

        let latest = store.get_latest(&pair, Timeframe::M15).unwrap();
        assert_eq!(latest.ts, now - 1000);
        assert_eq!(latest.price, Some(1.09));

        let range = store.get_range(&pair, Timeframe::M15, 0, 10);
        assert_eq!(range.len(), 3);
        assert!(range.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[test]
    fn size_retention_evicts_oldest() {
        let store = FeatureStore::with_retention(3, DEFAULT_TTL_MS, None);
        let pair = eurusd();
        let now = now_ms();
        for i in 0..5 {
            store.record_features_at(&pair, Timeframe::H1, features(1.0 + i as f64, 0.0), now + i);
        }
        let range = store.get_range(&pair, Timeframe::H1, 0, 10);
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].price, Some(3.0));
    }

    #[test]
    fn ttl_retention() {
        let store = FeatureStore::with_retention(100, 1000, None);
        let pair = eurusd();
        let now = now_ms();
        store.record_features_at(&pair, Timeframe::M15, features(1.0, 0.0), now - 5000);
        store.record_features_at(&pair, Timeframe::M15, features(2.0, 0.0), now);

        // The old entry was evicted eagerly on the second write.
        let range = store.get_range(&pair, Timeframe::M15, 0, 10);
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].price, Some(2.0));
    }

    #[test]
    fn purge_expired_clears_stale_keys() {
        let store = FeatureStore::with_retention(100, 1000, None);
        let pair = eurusd();
        let now = now_ms();
        store.record_features_at(&pair, Timeframe::M15, features(1.0, 0.0), now - 10_000);
        let removed = store.purge_expired();
        assert_eq!(removed, 1);
        assert!(store.get_latest(&pair, Timeframe::M15).is_none());
        assert_eq!(store.snapshot_summary().keys, 0);
    }

    #[test]
    fn hash_is_stable_under_key_order() {
        let mut a = BTreeMap::new();
        a.insert("beta".to_string(), FeatureValue::Number(2.0));
        a.insert("alpha".to_string(), FeatureValue::Number(1.0));

        let mut b = BTreeMap::new();
        b.insert("alpha".to_string(), FeatureValue::Number(1.0));
        b.insert("beta".to_string(), FeatureValue::Number(2.0));

        assert_eq!(stable_hash(&a), stable_hash(&b));

        let mut c = a.clone();
        c.insert("gamma".to_string(), FeatureValue::Number(3.0));
        assert_ne!(stable_hash(&a), stable_hash(&c));
    }

    #[test]
    fn snapshot_and_stats() {
        let store = FeatureStore::new(None);
        let pair = eurusd();
        let other = Pair::parse("GBPUSD").unwrap();
        let now = now_ms();

        store.record_features_at(&pair, Timeframe::M15, features(1.0, 0.0), now);
        store.record_features_at(&pair, Timeframe::H1, features(1.1, 0.0), now);
        store.record_features_at(&other, Timeframe::M15, features(1.2, 0.0), now);

        let snapshot = store.get_snapshot(&pair);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(&Timeframe::M15));
        assert!(snapshot.contains_key(&Timeframe::H1));

        let stats = store.get_stats(10);
        assert_eq!(stats.len(), 3);

        let summary = store.snapshot_summary();
        assert_eq!(summary.keys, 3);
        assert_eq!(summary.total_vectors, 3);
    }

    #[test]
    fn derived_fields_extracted() {
        let store = FeatureStore::new(None);
        let v = store.record_features_at(&eurusd(), Timeframe::M15, features(1.0850, 42.0), now_ms());
        assert_eq!(v.price, Some(1.0850));
        assert_eq!(v.score, Some(42.0));
        assert_eq!(v.direction.as_deref(), Some("BUY"));
        assert_eq!(v.hash.len(), 64);
    }
}
