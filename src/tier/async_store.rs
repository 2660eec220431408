//! Async Façade
//!
//! [`AsyncTieredStore`] lets tokio code use a [`TieredStore`] without
//! blocking the runtime: each call that may touch the disk tier or wait on a
//! segment lock runs on the blocking pool.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::task;

use super::accounting::StoreStatistics;
use super::coordinator::TieredStore;
use super::StoreKey;
use crate::element::Element;
use crate::error::{Error, Result};

/// Cloneable async handle to a shared [`TieredStore`]
pub struct AsyncTieredStore<K: StoreKey> {
    store: Arc<TieredStore<K>>,
}

impl<K: StoreKey> Clone for AsyncTieredStore<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K: StoreKey> From<TieredStore<K>> for AsyncTieredStore<K> {
    fn from(store: TieredStore<K>) -> Self {
        Self::new(Arc::new(store))
    }
}

impl<K: StoreKey> AsyncTieredStore<K> {
    pub fn new(store: Arc<TieredStore<K>>) -> Self {
        Self { store }
    }

    /// The wrapped blocking store
    pub fn inner(&self) -> &Arc<TieredStore<K>> {
        &self.store
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TieredStore<K>) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| Error::Internal(format!("blocking store task failed: {}", e)))?
    }

    pub async fn get(&self, key: K) -> Result<Option<Arc<Element<K>>>> {
        self.blocking(move |s| s.get(&key)).await
    }

    pub async fn get_quiet(&self, key: K) -> Result<Option<Arc<Element<K>>>> {
        self.blocking(move |s| s.get_quiet(&key)).await
    }

    /// Look up several keys concurrently, preserving order
    pub async fn get_all(&self, keys: Vec<K>) -> Result<Vec<Option<Arc<Element<K>>>>> {
        try_join_all(keys.into_iter().map(|key| self.get(key))).await
    }

    pub async fn put(&self, element: Element<K>) -> Result<bool> {
        self.blocking(move |s| s.put(element)).await
    }

    pub async fn put_pinned(&self, element: Element<K>) -> Result<bool> {
        self.blocking(move |s| s.put_pinned(element)).await
    }

    pub async fn put_if_absent(&self, element: Element<K>) -> Result<Option<Arc<Element<K>>>> {
        self.blocking(move |s| s.put_if_absent(element)).await
    }

    pub async fn remove(&self, key: K) -> Result<Option<Arc<Element<K>>>> {
        self.blocking(move |s| s.remove(&key)).await
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.blocking(|s| s.remove_all()).await
    }

    pub async fn expire_elements(&self) -> Result<usize> {
        self.blocking(|s| s.expire_elements()).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.blocking(|s| s.flush()).await
    }

    pub async fn dispose(&self) -> Result<()> {
        self.blocking(|s| s.dispose()).await
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn statistics(&self) -> StoreStatistics {
        self.store.statistics()
    }
}
