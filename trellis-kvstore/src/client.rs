//! Persist client: keeps keys this node owns alive in the store.
//!
//! Higher layers advertise state as *persistent* keys: the client
//! remembers every key it has set, refreshes its TTL ahead of expiry,
//! and re-asserts it (with a bumped version) if a peer overwrites it or
//! it falls out of the store. Deadlines are polled from the owner's
//! event loop rather than a task of its own, so all writes stay on one
//! loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use trellis_model::constants::MIN_TTL_REFRESH;
use trellis_model::{Publication, Value};

use crate::{KvStoreError, KvStoreHandle};

struct PersistedKey {
    value: Vec<u8>,
    version: u64,
}

pub struct KvStoreClient {
    node_name: String,
    kvstore: KvStoreHandle,
    key_ttl_ms: i64,
    refresh_interval: Duration,
    persisted: HashMap<(String, String), PersistedKey>,
    next_refresh: Option<Instant>,
}

impl KvStoreClient {
    pub fn new(kvstore: KvStoreHandle, key_ttl_ms: i64) -> Self {
        let refresh_interval = Duration::from_millis((key_ttl_ms.max(0) as u64) / 4)
            .max(MIN_TTL_REFRESH);
        Self {
            node_name: kvstore.node_name().to_string(),
            kvstore,
            key_ttl_ms,
            refresh_interval,
            persisted: HashMap::new(),
            next_refresh: None,
        }
    }

    /// Advertise `value` under `key` and keep it alive until cleared.
    /// Returns whether the store changed.
    pub async fn persist_key(
        &mut self,
        area: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, KvStoreError> {
        let current = self.fetch(area, key).await?;

        let already_mine = current.as_ref().is_some_and(|cur| {
            cur.originator_id == self.node_name && cur.value.as_deref() == Some(value.as_slice())
        });
        let version = current.map(|cur| cur.version + 1).unwrap_or(1);

        if already_mine {
            // Track it for refresh even if the bytes are already right.
            self.remember(area, key, value, version.saturating_sub(1));
            return Ok(false);
        }

        self.advertise(area, key, Value::new(version, &self.node_name, value.clone(), self.key_ttl_ms))
            .await?;
        self.remember(area, key, value, version);
        Ok(true)
    }

    /// Withdraw a key by advertising a tombstone body; stops refreshing
    /// it. The tombstone ages out with its TTL.
    pub async fn clear_key(
        &mut self,
        area: &str,
        key: &str,
        delete_body: Vec<u8>,
    ) -> Result<bool, KvStoreError> {
        let was_persisted = self
            .persisted
            .remove(&(area.to_string(), key.to_string()))
            .is_some();
        let current = self.fetch(area, key).await?;
        if current.is_none() && !was_persisted {
            return Ok(false);
        }
        let version = current.map(|cur| cur.version + 1).unwrap_or(1);
        self.advertise(
            area,
            key,
            Value::new(version, &self.node_name, delete_body, self.key_ttl_ms),
        )
        .await?;
        Ok(true)
    }

    pub fn is_persisted(&self, area: &str, key: &str) -> bool {
        self.persisted
            .contains_key(&(area.to_string(), key.to_string()))
    }

    /// When the owner's loop should next call [`refresh_ttls`].
    ///
    /// [`refresh_ttls`]: KvStoreClient::refresh_ttls
    pub fn next_refresh_deadline(&mut self) -> Option<Instant> {
        if self.persisted.is_empty() {
            self.next_refresh = None;
        } else if self.next_refresh.is_none() {
            self.next_refresh = Some(Instant::now() + self.refresh_interval);
        }
        self.next_refresh
    }

    /// Refresh the TTL of every persisted key, re-asserting any the
    /// store has lost or another node has overwritten.
    pub async fn refresh_ttls(&mut self) -> Result<(), KvStoreError> {
        self.next_refresh = None;
        let keys: Vec<(String, String)> = self.persisted.keys().cloned().collect();
        for (area, key) in keys {
            let current = self.fetch(&area, &key).await?;
            let Some(entry) = self.persisted.get_mut(&(area.clone(), key.clone())) else {
                continue;
            };
            match current {
                Some(cur)
                    if cur.originator_id == self.node_name
                        && cur.value.as_deref() == Some(entry.value.as_slice()) =>
                {
                    // Body intact: a hash-only TTL bump keeps it alive
                    // without looking like a content change downstream.
                    let mut refresh = cur.as_hash_only();
                    refresh.ttl_ms = self.key_ttl_ms;
                    refresh.ttl_version = cur.ttl_version + 1;
                    let value = refresh;
                    let node = self.node_name.clone();
                    tracing::trace!(area = %area, key = %key, node = %node, "ttl refresh");
                    self.advertise(&area, &key, value).await?;
                }
                other => {
                    // Lost or overwritten: re-assert with a higher version.
                    let version = other
                        .map(|cur| cur.version + 1)
                        .unwrap_or(entry.version + 1)
                        .max(entry.version + 1);
                    entry.version = version;
                    let value = Value::new(
                        version,
                        &self.node_name,
                        entry.value.clone(),
                        self.key_ttl_ms,
                    );
                    tracing::debug!(area = %area, key = %key, version, "re-asserting persisted key");
                    self.advertise(&area, &key, value).await?;
                }
            }
        }
        Ok(())
    }

    fn remember(&mut self, area: &str, key: &str, value: Vec<u8>, version: u64) {
        self.persisted
            .insert((area.to_string(), key.to_string()), PersistedKey { value, version });
    }

    async fn fetch(&self, area: &str, key: &str) -> Result<Option<Value>, KvStoreError> {
        let mut publication = self
            .kvstore
            .get_key_vals(area, vec![key.to_string()])
            .await?;
        Ok(publication.key_vals.remove(key))
    }

    async fn advertise(&self, area: &str, key: &str, value: Value) -> Result<(), KvStoreError> {
        let mut publication = Publication::new(area);
        publication.key_vals.insert(key.to_string(), value);
        self.kvstore.set_key_vals(area, publication).await
    }
}
