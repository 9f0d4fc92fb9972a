//! # Identity Resolver
//!
//! Players present two independent identifiers on join (a steam id and an
//! EOS id). A physical player accumulates several of each over time —
//! account sharing, platform migrations, id rotations — but every completed
//! join ties one steam id to one eos id. Treating those pairs as edges of a
//! bipartite graph, one physical player is one connected component.
//!
//! The resolver is a periodic batch job: build a union-find over `steam:X`
//! and `eos:Y` vertices, union every observed pair, aggregate each component
//! (names, sessions, first/last seen), and derive a stable canonical id by
//! hashing the sorted member identifiers. Output is a full refresh of the
//! `identities` and `identity_lookup` tables in 1000-row batches. The job is
//! idempotent and safe to re-run at any time.

use crate::sink::{AnalyticsStore, TelemetryError};
use bastion_events::JoinSucceededPayload;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Rows per insert batch on the full-refresh write.
pub const IDENTITY_BATCH_SIZE: usize = 1000;

/// One aggregated join observation: a (steam, eos) pairing with usage stats.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JoinObservation {
    pub steam_id: Option<String>,
    pub eos_id: Option<String>,
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_count: u64,
}

/// One resolved physical player.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanonicalIdentity {
    /// Stable opaque id: hex of the first 16 bytes of SHA-256 over the
    /// sorted, concatenated member identifiers.
    pub canonical_id: String,
    /// The most recently observed name.
    pub primary_name: String,
    pub all_steam_ids: Vec<String>,
    pub all_eos_ids: Vec<String>,
    pub all_names: Vec<String>,
    pub total_sessions: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One identifier → canonical id lookup row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdentityLookupRow {
    pub identifier: String,
    /// `steam` or `eos`.
    pub kind: String,
    pub canonical_id: String,
}

// ============================================================================
// Union-Find
// ============================================================================

/// Union-find with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    fn make_set(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves observations into canonical identities.
///
/// Two identifiers land in the same identity iff they are connected through
/// observed (steam, eos) pairs. Observations with only one identifier form
/// their own vertex and merge when a later pair links them.
pub fn resolve_identities(observations: &[JoinObservation]) -> Vec<CanonicalIdentity> {
    let mut uf = UnionFind::new();
    let mut vertex_of: HashMap<String, usize> = HashMap::new();

    let mut vertex = |uf: &mut UnionFind, map: &mut HashMap<String, usize>, key: String| -> usize {
        *map.entry(key).or_insert_with(|| uf.make_set())
    };

    // Edge pass: one vertex per identifier, one union per complete pair.
    for obs in observations {
        let steam = obs
            .steam_id
            .as_ref()
            .map(|s| vertex(&mut uf, &mut vertex_of, format!("steam:{s}")));
        let eos = obs
            .eos_id
            .as_ref()
            .map(|e| vertex(&mut uf, &mut vertex_of, format!("eos:{e}")));
        if let (Some(a), Some(b)) = (steam, eos) {
            uf.union(a, b);
        }
    }

    // Group observations by component root.
    let mut groups: HashMap<usize, Vec<&JoinObservation>> = HashMap::new();
    for obs in observations {
        let key = match (&obs.steam_id, &obs.eos_id) {
            (Some(s), _) => format!("steam:{s}"),
            (None, Some(e)) => format!("eos:{e}"),
            (None, None) => continue,
        };
        let Some(&v) = vertex_of.get(&key) else { continue };
        let root = uf.find(v);
        groups.entry(root).or_default().push(obs);
    }

    let mut identities: Vec<CanonicalIdentity> = groups
        .into_values()
        .map(aggregate_group)
        .collect();
    identities.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    identities
}

fn aggregate_group(observations: Vec<&JoinObservation>) -> CanonicalIdentity {
    let mut steam_ids: Vec<String> = Vec::new();
    let mut eos_ids: Vec<String> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut total_sessions = 0u64;
    let mut first_seen: Option<DateTime<Utc>> = None;
    let mut last_seen: Option<DateTime<Utc>> = None;
    let mut primary: Option<(&DateTime<Utc>, &str)> = None;

    for obs in &observations {
        if let Some(s) = &obs.steam_id {
            if !steam_ids.contains(s) {
                steam_ids.push(s.clone());
            }
        }
        if let Some(e) = &obs.eos_id {
            if !eos_ids.contains(e) {
                eos_ids.push(e.clone());
            }
        }
        if !names.contains(&obs.name) {
            names.push(obs.name.clone());
        }
        total_sessions += obs.session_count;
        first_seen = Some(match first_seen {
            Some(f) => f.min(obs.first_seen),
            None => obs.first_seen,
        });
        last_seen = Some(match last_seen {
            Some(l) => l.max(obs.last_seen),
            None => obs.last_seen,
        });
        if primary.map(|(at, _)| obs.last_seen > *at).unwrap_or(true) {
            primary = Some((&obs.last_seen, &obs.name));
        }
    }

    steam_ids.sort_unstable();
    eos_ids.sort_unstable();
    names.sort_unstable();

    CanonicalIdentity {
        canonical_id: canonical_id_for(&steam_ids, &eos_ids),
        primary_name: primary.map(|(_, n)| n.to_string()).unwrap_or_default(),
        all_steam_ids: steam_ids,
        all_eos_ids: eos_ids,
        all_names: names,
        total_sessions,
        first_seen: first_seen.unwrap_or_else(Utc::now),
        last_seen: last_seen.unwrap_or_else(Utc::now),
    }
}

/// Hashes the sorted member identifiers into the stable canonical id.
fn canonical_id_for(steam_ids: &[String], eos_ids: &[String]) -> String {
    let mut members: Vec<String> = steam_ids
        .iter()
        .map(|s| format!("steam:{s}"))
        .chain(eos_ids.iter().map(|e| format!("eos:{e}")))
        .collect();
    members.sort_unstable();

    let mut hasher = Sha256::new();
    for member in &members {
        hasher.update(member.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Expands identities into lookup rows, one per member identifier.
pub fn lookup_rows(identities: &[CanonicalIdentity]) -> Vec<IdentityLookupRow> {
    let mut rows = Vec::new();
    for identity in identities {
        for steam in &identity.all_steam_ids {
            rows.push(IdentityLookupRow {
                identifier: steam.clone(),
                kind: "steam".to_string(),
                canonical_id: identity.canonical_id.clone(),
            });
        }
        for eos in &identity.all_eos_ids {
            rows.push(IdentityLookupRow {
                identifier: eos.clone(),
                kind: "eos".to_string(),
                canonical_id: identity.canonical_id.clone(),
            });
        }
    }
    rows
}

// ============================================================================
// The Batch Job
// ============================================================================

/// Runs the resolution and writes the full refresh in batches.
pub struct IdentityResolver {
    store: Arc<dyn AnalyticsStore>,
    batch_size: usize,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            store,
            batch_size: IDENTITY_BATCH_SIZE,
        }
    }

    #[cfg(test)]
    fn with_batch_size(store: Arc<dyn AnalyticsStore>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    /// Full refresh: clear both tables, then insert identities and lookup
    /// rows in `batch_size` chunks.
    pub async fn run(&self, observations: &[JoinObservation]) -> Result<usize, TelemetryError> {
        let identities = resolve_identities(observations);
        let rows = lookup_rows(&identities);

        self.store.clear_identities().await?;
        for batch in identities.chunks(self.batch_size) {
            self.store.insert_identities(batch).await?;
        }
        for batch in rows.chunks(self.batch_size) {
            self.store.insert_identity_lookup(batch).await?;
        }
        info!(
            "🪪 Identity refresh complete: {} observations -> {} identities",
            observations.len(),
            identities.len()
        );
        Ok(identities.len())
    }
}

// ============================================================================
// Live Observation Ledger
// ============================================================================

/// Accumulates join observations from the live event stream between resolver
/// runs. Keyed by the (steam, eos) pairing so repeated joins fold into
/// session counts instead of duplicate rows.
#[derive(Default)]
pub struct JoinLedger {
    entries: DashMap<(Option<String>, Option<String>), JoinObservation>,
}

impl JoinLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed join.
    pub fn record(&self, payload: &JoinSucceededPayload, at: DateTime<Utc>) {
        let key = (payload.steam_id.clone(), payload.eos_id.clone());
        self.entries
            .entry(key)
            .and_modify(|obs| {
                obs.session_count += 1;
                obs.last_seen = obs.last_seen.max(at);
                obs.name = payload.player_name.clone();
            })
            .or_insert_with(|| JoinObservation {
                steam_id: payload.steam_id.clone(),
                eos_id: payload.eos_id.clone(),
                name: payload.player_name.clone(),
                first_seen: at,
                last_seen: at,
                session_count: 1,
            });
    }

    /// Snapshot of all accumulated observations.
    pub fn snapshot(&self) -> Vec<JoinObservation> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn obs(steam: Option<&str>, eos: Option<&str>, name: &str, sessions: u64) -> JoinObservation {
        JoinObservation {
            steam_id: steam.map(String::from),
            eos_id: eos.map(String::from),
            name: name.to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            session_count: sessions,
        }
    }

    #[test]
    fn transitive_pairs_collapse_into_one_identity() {
        // (s1,e1), (s1,e2), (s2,e2) are one connected component.
        let observations = vec![
            obs(Some("s1"), Some("e1"), "Alice", 2),
            obs(Some("s1"), Some("e2"), "Alice2", 1),
            obs(Some("s2"), Some("e2"), "Alice3", 3),
        ];
        let identities = resolve_identities(&observations);
        assert_eq!(identities.len(), 1);
        let identity = &identities[0];
        assert_eq!(identity.all_steam_ids, vec!["s1", "s2"]);
        assert_eq!(identity.all_eos_ids, vec!["e1", "e2"]);
        assert_eq!(identity.total_sessions, 6);
    }

    #[test]
    fn disconnected_pairs_stay_separate() {
        let observations = vec![
            obs(Some("s1"), Some("e1"), "Alice", 1),
            obs(Some("s2"), Some("e2"), "Bob", 1),
        ];
        let identities = resolve_identities(&observations);
        assert_eq!(identities.len(), 2);
        assert_ne!(identities[0].canonical_id, identities[1].canonical_id);
    }

    #[test]
    fn canonical_id_is_stable_across_observation_order() {
        let forward = vec![
            obs(Some("s1"), Some("e1"), "Alice", 1),
            obs(Some("s2"), Some("e1"), "Alice", 1),
        ];
        let reversed: Vec<JoinObservation> = forward.iter().rev().cloned().collect();
        let a = resolve_identities(&forward);
        let b = resolve_identities(&reversed);
        assert_eq!(a[0].canonical_id, b[0].canonical_id);
        assert_eq!(a[0].canonical_id.len(), 32); // 16 bytes hex
    }

    #[test]
    fn most_recent_name_becomes_primary() {
        let old = Utc::now() - chrono::Duration::days(10);
        let new = Utc::now();
        let observations = vec![
            JoinObservation {
                steam_id: Some("s1".into()),
                eos_id: Some("e1".into()),
                name: "OldName".into(),
                first_seen: old,
                last_seen: old,
                session_count: 5,
            },
            JoinObservation {
                steam_id: Some("s1".into()),
                eos_id: Some("e2".into()),
                name: "NewName".into(),
                first_seen: new,
                last_seen: new,
                session_count: 1,
            },
        ];
        let identities = resolve_identities(&observations);
        assert_eq!(identities[0].primary_name, "NewName");
        assert_eq!(identities[0].first_seen, old);
        assert_eq!(identities[0].last_seen, new);
    }

    #[test]
    fn lookup_rows_cover_every_identifier() {
        let observations = vec![
            obs(Some("s1"), Some("e1"), "Alice", 1),
            obs(Some("s2"), Some("e1"), "Alice", 1),
        ];
        let identities = resolve_identities(&observations);
        let rows = lookup_rows(&identities);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.canonical_id == identities[0].canonical_id));
    }

    /// Store that records how many rows each insert batch carried.
    #[derive(Default)]
    struct CountingStore {
        cleared: Mutex<usize>,
        identity_batches: Mutex<Vec<usize>>,
        lookup_batches: Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl AnalyticsStore for CountingStore {
        async fn clear_identities(&self) -> Result<(), TelemetryError> {
            *self.cleared.lock().unwrap() += 1;
            Ok(())
        }
        async fn insert_identities(
            &self,
            batch: &[CanonicalIdentity],
        ) -> Result<(), TelemetryError> {
            self.identity_batches.lock().unwrap().push(batch.len());
            Ok(())
        }
        async fn insert_identity_lookup(
            &self,
            batch: &[IdentityLookupRow],
        ) -> Result<(), TelemetryError> {
            self.lookup_batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn refresh_writes_in_batches_and_is_idempotent() {
        let store = Arc::new(CountingStore::default());
        let resolver =
            IdentityResolver::with_batch_size(Arc::clone(&store) as Arc<dyn AnalyticsStore>, 2);

        let observations: Vec<JoinObservation> = (0..5)
            .map(|i| obs(Some(&format!("s{i}")), Some(&format!("e{i}")), "P", 1))
            .collect();

        let count = resolver.run(&observations).await.unwrap();
        assert_eq!(count, 5);
        assert_eq!(*store.identity_batches.lock().unwrap(), vec![2, 2, 1]);
        // 10 lookup rows in batches of 2
        assert_eq!(store.lookup_batches.lock().unwrap().len(), 5);

        // Re-running clears and rewrites the same result.
        let count2 = resolver.run(&observations).await.unwrap();
        assert_eq!(count2, 5);
        assert_eq!(*store.cleared.lock().unwrap(), 2);
    }

    #[test]
    fn ledger_folds_repeat_joins_into_sessions() {
        let ledger = JoinLedger::new();
        let payload = JoinSucceededPayload {
            player_name: "Alice".into(),
            steam_id: Some("s1".into()),
            eos_id: Some("e1".into()),
        };
        ledger.record(&payload, Utc::now());
        ledger.record(&payload, Utc::now());
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_count, 2);
    }
}
