//! Process-wide cache of live connections.
//!
//! Connections are keyed by `(resource id, sub-resource)`. A miss is resolved
//! by a caller-supplied loader; concurrent misses on the same key share one
//! loader run (single-flight) while misses on different keys proceed in
//! parallel. Entries leave the cache only through [`ConnCache::invalidate`],
//! [`ConnCache::invalidate_by_owner`] or [`ConnCache::close_all`], which also
//! close the connection. Dropping the last caller-held `Arc` is not eviction.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Returned to waiters whose attempt was invalidated before it finished.
pub const STALE_CONNECTION: &str = "连接已失效，请重试";

/// A connection that can live in a [`ConnCache`].
#[async_trait]
pub trait LiveConnection: Send + Sync + 'static {
    /// Closes the underlying driver handle.
    async fn close(&self);

    /// Whether the handle has been closed and must not be handed out.
    fn is_closed(&self) -> bool;
}

/// Cache key: owning resource plus the sub-resource addressed inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey<S> {
    /// Owning resource (database or redis record id).
    pub resource_id: u64,
    /// Database name or db index.
    pub sub: S,
}

impl<S> ResourceKey<S> {
    pub fn new(resource_id: u64, sub: S) -> Self {
        Self { resource_id, sub }
    }
}

impl<S: Display> Display for ResourceKey<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.sub)
    }
}

/// One resolution attempt. The cell holds the loader outcome, error included,
/// so every waiter of the attempt observes the same result.
struct Flight<C> {
    cell: OnceCell<AppResult<Arc<C>>>,
}

impl<C> Flight<C> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    fn ready(&self) -> Option<&Arc<C>> {
        match self.cell.get() {
            Some(Ok(conn)) => Some(conn),
            _ => None,
        }
    }
}

/// Keyed connection cache with single-flight resolution.
pub struct ConnCache<S, C> {
    name: &'static str,
    entries: DashMap<ResourceKey<S>, Arc<Flight<C>>>,
}

impl<S, C> ConnCache<S, C>
where
    S: Clone + Eq + Hash + Display + Send + Sync + 'static,
    C: LiveConnection,
{
    /// Creates an empty cache; `name` labels its log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    /// Returns the cached connection for `key`, or resolves it with `loader`.
    ///
    /// `loader` runs at most once per attempt no matter how many callers race
    /// on the key; its error is returned to all of them and nothing is cached,
    /// so the next call starts a new attempt.
    pub async fn get_or_create<F, Fut>(&self, key: ResourceKey<S>, loader: F) -> AppResult<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<C>>,
    {
        if let Some(conn) = self.cached(&key) {
            return Ok(conn);
        }

        let flight = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Flight::new()))
            .value()
            .clone();

        let result = flight
            .cell
            .get_or_init(move || async move { loader().await.map(Arc::new) })
            .await
            .clone();

        let still_cached = self
            .entries
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), &flight));

        match result {
            Ok(conn) if !still_cached => {
                // 建立期间已被失效：连接按失效前的授权建立，关闭后不交给调用方
                conn.close().await;
                tracing::info!(cache = self.name, key = %key, "连接建立期间已被失效，已关闭");
                Err(AppError::ConnectionFailed(STALE_CONNECTION.to_string()))
            }
            Err(e) if still_cached => {
                self.entries.remove_if(&key, |_, v| Arc::ptr_eq(v, &flight));
                tracing::warn!(cache = self.name, key = %key, error = %e, "获取连接失败");
                Err(e)
            }
            other => other,
        }
    }

    /// Ready, open connection for `key`. A closed one is evicted.
    fn cached(&self, key: &ResourceKey<S>) -> Option<Arc<C>> {
        let flight = self.entries.get(key)?.value().clone();
        let conn = flight.ready()?.clone();
        if conn.is_closed() {
            self.entries.remove_if(key, |_, v| Arc::ptr_eq(v, &flight));
            return None;
        }
        Some(conn)
    }

    /// Closes and removes the entry for `key`. Returns whether one existed.
    ///
    /// An attempt still in flight is detached: when it finishes its connection
    /// is closed and its waiters get [`STALE_CONNECTION`].
    pub async fn invalidate(&self, key: &ResourceKey<S>) -> bool {
        let Some((_, flight)) = self.entries.remove(key) else {
            return false;
        };
        if let Some(conn) = flight.ready().cloned() {
            conn.close().await;
            tracing::info!(cache = self.name, key = %key, "关闭连接");
        }
        true
    }

    /// Closes and removes every entry of `resource_id`. Returns the count.
    pub async fn invalidate_by_owner(&self, resource_id: u64) -> usize {
        let keys: Vec<ResourceKey<S>> = self
            .entries
            .iter()
            .filter(|entry| entry.key().resource_id == resource_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in &keys {
            if self.invalidate(key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Any open connection matching `pred`.
    pub fn get_any_where(&self, pred: impl Fn(&ResourceKey<S>, &C) -> bool) -> Option<Arc<C>> {
        self.entries.iter().find_map(|entry| {
            let conn = entry.value().ready()?;
            (!conn.is_closed() && pred(entry.key(), conn)).then(|| conn.clone())
        })
    }

    /// Any open connection of `resource_id`.
    pub fn get_any_by_owner(&self, resource_id: u64) -> Option<Arc<C>> {
        self.get_any_where(|key, _| key.resource_id == resource_id)
    }

    /// Closes every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let keys: Vec<ResourceKey<S>> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in &keys {
            if self.invalidate(key).await {
                removed += 1;
            }
        }
        tracing::info!(cache = self.name, count = removed, "已关闭全部连接");
        removed
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().ready().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
