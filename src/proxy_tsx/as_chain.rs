//! The AsChain table (spec §3 `AsChain`, §9 "AsChain lifecycle and ODI").
//!
//! Cross-request state lives in one table keyed by ODI token, locked per-entry the
//! same way the teacher's `PendingNonceManager` locks per-address nonce state: the
//! dashmap shard lock is held only long enough to clone out the per-key `Arc<Mutex<_>>`,
//! never across an `.await`.

use crate::types::{AsChain, OdiToken};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::RngCore;
use std::sync::{Arc, Mutex};

pub struct AsChainTable {
    entries: DashMap<OdiToken, Arc<Mutex<AsChain>>>,
}

impl AsChainTable {
    pub fn new() -> Self {
        AsChainTable {
            entries: DashMap::new(),
        }
    }

    /// Mints a fresh ODI token with >=128 bits of entropy (spec §6 "ODI Route
    /// parameter"), base64url-encoded, and inserts `chain` under it.
    pub fn insert(&self, chain: AsChain) -> OdiToken {
        let mut bytes = [0u8; 18];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        self.entries.insert(token.clone(), Arc::new(Mutex::new(chain)));
        token
    }

    /// Short-locks the table to clone out the per-entry handle, then locks only that
    /// handle for the bump. Returns `None` if the token has been reaped.
    pub fn with_chain<R>(&self, token: &OdiToken, f: impl FnOnce(&mut AsChain) -> R) -> Option<R> {
        let slot = self.entries.get(token).map(|entry| entry.clone())?;
        let mut chain = slot.lock().expect("as-chain mutex poisoned");
        Some(f(&mut chain))
    }

    pub fn remove(&self, token: &OdiToken) {
        self.entries.remove(token);
    }
}

impl Default for AsChainTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::SessionCase;

    fn chain() -> AsChain {
        AsChain {
            served_user: "sip:alice@home.net".to_string(),
            session_case: SessionCase::Originating,
            originating: true,
            hops: vec![],
            next_index: 0,
            base_request_snapshot: None,
            refcount: 1,
        }
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let table = AsChainTable::new();
        let token = table.insert(chain());
        let served_user = table
            .with_chain(&token, |c| c.served_user.clone())
            .unwrap();
        assert_eq!(served_user, "sip:alice@home.net");
    }

    #[test]
    fn removed_token_misses() {
        let table = AsChainTable::new();
        let token = table.insert(chain());
        table.remove(&token);
        assert!(table.with_chain(&token, |_| ()).is_none());
    }
}
