//! In-memory `Store` implementation used by tests and single-node deployments.
//!
//! Locking follows the teacher's `PendingNonceManager`: the top-level map is a
//! `DashMap` guarding only the *existence* of a per-key lock, and the actual record is
//! behind its own `Arc<Mutex<_>>` cloned out of the map before the lock is held across
//! any `.await` — the dashmap shard lock is never held while we're not doing pure,
//! synchronous bookkeeping.
//!
//! Replication to peers is in-process only: the core has no cluster membership
//! protocol (spec §1 Non-goals), so a "remote store" here is another `MemoryStore`
//! handle wired in at construction time via [`MemoryStore::with_peers`], standing in
//! for whatever networked backend a real deployment would point `set`/`get` at.

use crate::error::StoreError;
use crate::store::{Store, StoreEntry, Table};
use crate::types::{now, Timestamp};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Record {
    data: Option<Vec<u8>>,
    cas: u64,
    expires_at: Option<Timestamp>,
}

impl Record {
    fn live_data(&self, at: Timestamp) -> Option<Vec<u8>> {
        match self.expires_at {
            Some(expires_at) if expires_at <= at => None,
            _ => self.data.clone(),
        }
    }
}

pub struct MemoryStore {
    aor: DashMap<String, Arc<Mutex<Record>>>,
    auth_vector: DashMap<String, Arc<Mutex<Record>>>,
    impi: DashMap<String, Arc<Mutex<Record>>>,
    next_cas: AtomicU64,
    peers: Vec<Arc<MemoryStore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_peers(Vec::new())
    }

    /// Builds a store that best-effort replicates writes to, and falls back to reads
    /// from, each of `peers`. Used to exercise the replication contract in-process;
    /// a networked `Store` backend would dial `NodeConfig::remote_store_endpoints`
    /// instead of taking peer handles directly.
    pub fn with_peers(peers: Vec<Arc<MemoryStore>>) -> Self {
        MemoryStore {
            aor: DashMap::new(),
            auth_vector: DashMap::new(),
            impi: DashMap::new(),
            next_cas: AtomicU64::new(1),
            peers,
        }
    }

    fn table(&self, table: Table) -> &DashMap<String, Arc<Mutex<Record>>> {
        match table {
            Table::Aor => &self.aor,
            Table::AuthVector => &self.auth_vector,
            Table::Impi => &self.impi,
        }
    }

    fn slot(&self, table: Table, key: &str) -> Arc<Mutex<Record>> {
        self.table(table)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Applies a replicated write unconditionally. Peer replication bypasses CAS: the
    /// peer's own CAS counter is independent of the writer's, so presenting the
    /// writer's token would always conflict.
    fn force_write(&self, table: Table, key: &str, data: Option<Vec<u8>>, expires_at: Option<Timestamp>) {
        let slot = self.slot(table, key);
        let mut record = slot.lock().expect("store mutex poisoned");
        record.data = data;
        record.expires_at = expires_at;
        record.cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
    }

    /// Best-effort fan-out to every peer. A peer write never reports failure back to
    /// the caller that triggered replication (spec §9 "replication is best-effort").
    fn replicate(&self, table: Table, key: &str, data: Option<Vec<u8>>, expires_at: Option<Timestamp>) {
        for peer in &self.peers {
            peer.force_write(table, key, data.clone(), expires_at);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<StoreEntry, StoreError> {
        let at = now();
        let (data, cas) = {
            let slot = self.slot(table, key);
            let record = slot.lock().expect("store mutex poisoned");
            (record.live_data(at), record.cas)
        };
        if data.is_some() {
            return Ok(StoreEntry { data, cas });
        }
        // Local miss: fall back to remote stores in deterministic (construction)
        // order (spec §4.1).
        for peer in &self.peers {
            let remote = Box::pin(peer.get(table, key)).await?;
            if remote.data.is_some() {
                return Ok(remote);
            }
        }
        Ok(StoreEntry { data, cas })
    }

    async fn set(
        &self,
        table: Table,
        key: &str,
        data: Vec<u8>,
        cas: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(now() + ttl.as_secs())
        };
        {
            let slot = self.slot(table, key);
            let mut record = slot.lock().expect("store mutex poisoned");
            if record.cas != cas {
                return Err(StoreError::CasConflict(key.to_string()));
            }
            record.data = Some(data.clone());
            record.expires_at = expires_at;
            record.cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        }
        self.replicate(table, key, Some(data), expires_at);
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str, cas: u64) -> Result<(), StoreError> {
        {
            let slot = self.slot(table, key);
            let mut record = slot.lock().expect("store mutex poisoned");
            if record.cas != cas {
                return Err(StoreError::CasConflict(key.to_string()));
            }
            record.data = None;
            record.expires_at = None;
            record.cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        }
        self.replicate(table, key, None, None);
        Ok(())
    }

    fn has_servers(&self) -> bool {
        !self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_on_fresh_key_requires_cas_zero() {
        let store = MemoryStore::new();
        store
            .set(Table::Aor, "sip:alice@example.com", b"one".to_vec(), 0, Duration::ZERO)
            .await
            .unwrap();
        let entry = store.get(Table::Aor, "sip:alice@example.com").await.unwrap();
        assert_eq!(entry.data.as_deref(), Some(&b"one"[..]));
        assert_ne!(entry.cas, 0);
    }

    #[tokio::test]
    async fn stale_cas_is_rejected() {
        let store = MemoryStore::new();
        store
            .set(Table::Aor, "sip:bob@example.com", b"one".to_vec(), 0, Duration::ZERO)
            .await
            .unwrap();
        let err = store
            .set(Table::Aor, "sip:bob@example.com", b"two".to_vec(), 0, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CasConflict(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_only_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let entry = store.get(Table::Aor, "sip:carol@example.com").await.unwrap();
        let cas = entry.cas;

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .set(Table::Aor, "sip:carol@example.com", b"a".to_vec(), cas, Duration::ZERO)
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .set(Table::Aor, "sip:carol@example.com", b"b".to_vec(), cas, Duration::ZERO)
                    .await
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|x| **x).count(), 1);
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent() {
        let store = MemoryStore::new();
        // force_write bypasses CAS the way peer replication does; used here only to
        // plant an already-expired record without waiting out a real ttl.
        store.force_write(Table::AuthVector, "k", Some(b"v".to_vec()), Some(0));
        let entry = store.get(Table::AuthVector, "k").await.unwrap();
        assert!(entry.data.is_none());
    }

    #[tokio::test]
    async fn writes_replicate_to_peers_best_effort() {
        let peer = Arc::new(MemoryStore::new());
        let primary = MemoryStore::with_peers(vec![peer.clone()]);
        assert!(primary.has_servers());

        primary
            .set(Table::Aor, "sip:dora@example.com", b"one".to_vec(), 0, Duration::ZERO)
            .await
            .unwrap();

        let on_peer = peer.get(Table::Aor, "sip:dora@example.com").await.unwrap();
        assert_eq!(on_peer.data.as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn reads_fall_back_to_peers_on_local_miss() {
        let peer = Arc::new(MemoryStore::new());
        peer.set(Table::Aor, "sip:erin@example.com", b"remote".to_vec(), 0, Duration::ZERO)
            .await
            .unwrap();
        let primary = MemoryStore::with_peers(vec![peer]);

        let entry = primary.get(Table::Aor, "sip:erin@example.com").await.unwrap();
        assert_eq!(entry.data.as_deref(), Some(&b"remote"[..]));
    }

    #[tokio::test]
    async fn store_without_peers_reports_no_servers() {
        let store = MemoryStore::new();
        assert!(!store.has_servers());
    }
}
