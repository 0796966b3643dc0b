//! The replicated key/value abstraction the registrar, subscription manager, and AV
//! cache sit on top of (spec §6 Store interface). `Store` is deliberately narrow —
//! get/set-with-CAS over opaque byte blobs per table, plus TTL and best-effort
//! multi-server replication — so a production deployment can back it with a real
//! replicated store without the core caring. Replication topology (`has_servers`) is
//! an implementation detail of the concrete `Store`, not something callers configure;
//! the core never dials remote endpoints itself (spec §1 Non-goals: no cluster
//! membership).

pub mod memory;

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// Logical partition within the store. Kept as an enum (rather than a free-form
/// namespace string) so a backend can route tables to different underlying stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Aor,
    AuthVector,
    Impi,
}

/// One read of a stored record: the serialized value, if present, plus an opaque CAS
/// token that must be presented unchanged to `set` for the write to succeed.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub data: Option<Vec<u8>>,
    pub cas: u64,
}

/// A replicated, optimistically-concurrent key/value store (spec §6).
///
/// `async fn` methods here follow the teacher's `Facilitator`/`ChainProviderOps`
/// pattern of plain `async fn` in a trait rather than `#[async_trait]`: the trait is
/// only ever used behind a concrete type or `Arc<dyn Store>` is avoided in favor of
/// static dispatch, so no boxing is required.
pub trait Store: Send + Sync + 'static {
    fn get(
        &self,
        table: Table,
        key: &str,
    ) -> impl Future<Output = Result<StoreEntry, StoreError>> + Send;

    /// Writes `data` iff the record's current CAS token still equals `cas`. A `cas` of
    /// `0` means "key must not already exist". Implementations must detect conflicting
    /// concurrent writers and return [`StoreError::CasConflict`] rather than silently
    /// overwriting (spec §5 concurrency model). `ttl` bounds how long the record is
    /// retained; `Duration::ZERO` means the record never expires on its own.
    fn set(
        &self,
        table: Table,
        key: &str,
        data: Vec<u8>,
        cas: u64,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes a record outright, used for star-deregistration and AV consumption.
    fn delete(
        &self,
        table: Table,
        key: &str,
        cas: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether this store instance has remote replicas configured (spec §6). Callers
    /// use this only to decide what to log; replication/fallback happens inside `set`
    /// and `get` regardless.
    fn has_servers(&self) -> bool;
}

impl<T: Store> Store for std::sync::Arc<T> {
    fn get(
        &self,
        table: Table,
        key: &str,
    ) -> impl Future<Output = Result<StoreEntry, StoreError>> + Send {
        (**self).get(table, key)
    }

    fn set(
        &self,
        table: Table,
        key: &str,
        data: Vec<u8>,
        cas: u64,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).set(table, key, data, cas, ttl)
    }

    fn delete(
        &self,
        table: Table,
        key: &str,
        cas: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).delete(table, key, cas)
    }

    fn has_servers(&self) -> bool {
        (**self).has_servers()
    }
}
