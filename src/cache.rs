use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::certificate::Certificate;
use crate::config::CacheOptions;
use crate::singleflight::WaitTable;

#[derive(Default)]
struct CacheInner {
  /// Primary store, keyed by content hash.
  by_hash: HashMap<String, Certificate>,
  /// Name index; wildcard names are stored with a literal `*` label.
  by_name: HashMap<String, Vec<String>>,
}

/// Process-wide in-memory certificate store.
///
/// Readers copy records out under the read lock; writers take the write
/// lock only to insert, replace, or remove by hash. The two singleflight
/// tables live here so that independent caches never collide on a name.
pub struct Cache {
  inner: RwLock<CacheInner>,
  options: RwLock<CacheOptions>,
  /// Guards storage-load operations, keyed by normalized name.
  pub(crate) loaders: WaitTable,
  /// Guards issuance and renewal operations, keyed by normalized name.
  pub(crate) issuers: WaitTable,
}

impl Cache {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: RwLock::new(CacheInner::default()),
      options: RwLock::new(options),
      loaders: WaitTable::new(),
      issuers: WaitTable::new(),
    }
  }

  /// Inserts a record, indexing it under every name it certifies.
  ///
  /// At capacity, an arbitrary record is evicted to make room; callers
  /// must tolerate records disappearing between operations anyway.
  pub async fn insert(&self, cert: Certificate) {
    let capacity = self.options.read().await.capacity;
    let mut inner = self.inner.write().await;
    if capacity > 0 && inner.by_hash.len() >= capacity && !inner.by_hash.contains_key(&cert.hash) {
      if let Some(victim) = inner.by_hash.keys().next().cloned() {
        debug!(hash = %victim, "certificate cache full, evicting");
        remove_locked(&mut inner, &victim);
      }
    }
    insert_locked(&mut inner, cert);
  }

  /// Replaces the record stored under `old_hash` with `new`.
  ///
  /// Tolerates `old_hash` having been evicted already; the new record is
  /// inserted either way.
  pub async fn replace(&self, old_hash: &str, new: Certificate) {
    let mut inner = self.inner.write().await;
    remove_locked(&mut inner, old_hash);
    insert_locked(&mut inner, new);
  }

  /// Removes the record stored under `hash`, if present.
  pub async fn remove(&self, hash: &str) {
    let mut inner = self.inner.write().await;
    remove_locked(&mut inner, hash);
  }

  pub async fn get_by_hash(&self, hash: &str) -> Option<Certificate> {
    self.inner.read().await.by_hash.get(hash).cloned()
  }

  /// Returns copies of every record indexed under `name` (exact key match;
  /// wildcard expansion is the lookup's concern).
  pub async fn certs_for_name(&self, name: &str) -> Vec<Certificate> {
    let inner = self.inner.read().await;
    inner
      .by_name
      .get(name)
      .map(|hashes| {
        hashes
          .iter()
          .filter_map(|hash| inner.by_hash.get(hash).cloned())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Returns a copy of every cached record.
  pub async fn all(&self) -> Vec<Certificate> {
    self.inner.read().await.by_hash.values().cloned().collect()
  }

  pub async fn len(&self) -> usize {
    self.inner.read().await.by_hash.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.inner.read().await.by_hash.is_empty()
  }

  /// Whether occupancy has reached the configured almost-full threshold.
  pub async fn almost_full(&self) -> bool {
    let options = self.options.read().await;
    if options.capacity == 0 {
      return false;
    }
    let len = self.inner.read().await.by_hash.len();
    len * 100 >= options.capacity * options.almost_full_percent as usize
  }

  /// Updates cache options; takes effect for subsequent operations.
  pub async fn set_options(&self, options: CacheOptions) {
    *self.options.write().await = options;
  }
}

fn insert_locked(inner: &mut CacheInner, cert: Certificate) {
  for name in &cert.names {
    let hashes = inner.by_name.entry(name.clone()).or_default();
    if !hashes.contains(&cert.hash) {
      hashes.push(cert.hash.clone());
    }
  }
  inner.by_hash.insert(cert.hash.clone(), cert);
}

fn remove_locked(inner: &mut CacheInner, hash: &str) {
  let Some(cert) = inner.by_hash.remove(hash) else {
    return;
  };
  for name in &cert.names {
    if let Some(hashes) = inner.by_name.get_mut(name) {
      hashes.retain(|h| h != hash);
      if hashes.is_empty() {
        inner.by_name.remove(name);
      }
    }
  }
}
