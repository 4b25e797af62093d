use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

type Entries = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// A per-name wait table collapsing concurrent identical operations.
///
/// The first caller to ask for a name becomes the owner and runs the
/// operation; everyone else receives a one-shot broadcast signal to wait
/// on. The signal carries no value: the owner publishes its result to the
/// certificate cache before releasing, and waiters re-query the cache.
#[derive(Debug, Default)]
pub(crate) struct WaitTable {
  entries: Entries,
}

/// Outcome of [`WaitTable::acquire`].
pub(crate) enum Acquired {
  /// This caller owns the operation and must release the slot when done.
  Owner(OwnerSlot),
  /// Another caller owns the operation; wait on the signal.
  Waiter(watch::Receiver<()>),
}

/// Owned side of a wait-table entry.
///
/// Dropping the slot removes the entry and closes the signal, waking every
/// waiter; this also covers panics and timed-out futures. The signal is
/// closed only after the table lock is released.
pub(crate) struct OwnerSlot {
  name: String,
  entries: Entries,
  tx: Option<watch::Sender<()>>,
}

impl WaitTable {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Finds an existing waiter entry or installs a new one, atomically.
  pub(crate) fn acquire(&self, name: &str) -> Acquired {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(rx) = entries.get(name) {
      return Acquired::Waiter(rx.clone());
    }
    let (tx, rx) = watch::channel(());
    entries.insert(name.to_string(), rx);
    Acquired::Owner(OwnerSlot {
      name: name.to_string(),
      entries: Arc::clone(&self.entries),
      tx: Some(tx),
    })
  }

  #[cfg(test)]
  pub(crate) fn contains(&self, name: &str) -> bool {
    self
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains_key(name)
  }
}

impl Drop for OwnerSlot {
  fn drop(&mut self) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.remove(&self.name);
    drop(entries);
    // Closing the signal outside the table lock keeps waiter wakeups from
    // ever running under it.
    self.tx.take();
  }
}

/// Blocks on an owner's completion signal, bounded by the safety timeout.
///
/// Returns `Err(())` when the timeout fires; the in-flight owner keeps
/// running. Caller cancellation is expressed by dropping the future.
pub(crate) async fn wait_for_signal(mut rx: watch::Receiver<()>, timeout: Duration) -> Result<(), ()> {
  tokio::time::timeout(timeout, async {
    // The sender never sends; a closed channel is the completion signal.
    while rx.changed().await.is_ok() {}
  })
  .await
  .map_err(|_| ())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn test_first_acquire_owns_rest_wait() {
    let table = WaitTable::new();
    let owner = match table.acquire("example.com") {
      Acquired::Owner(slot) => slot,
      Acquired::Waiter(_) => panic!("first acquire should own"),
    };
    assert!(matches!(table.acquire("example.com"), Acquired::Waiter(_)));
    // A different name gets its own owner
    assert!(matches!(table.acquire("other.example.com"), Acquired::Owner(_)));
    drop(owner);
    assert!(matches!(table.acquire("example.com"), Acquired::Owner(_)));
  }

  #[tokio::test]
  async fn test_release_unblocks_waiters() {
    let table = Arc::new(WaitTable::new());
    let owner = match table.acquire("example.com") {
      Acquired::Owner(slot) => slot,
      Acquired::Waiter(_) => panic!("first acquire should own"),
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
      let rx = match table.acquire("example.com") {
        Acquired::Waiter(rx) => rx,
        Acquired::Owner(_) => panic!("entry already taken"),
      };
      handles.push(tokio::spawn(wait_for_signal(rx, Duration::from_secs(5))));
    }

    drop(owner);
    for handle in handles {
      assert!(handle.await.unwrap().is_ok());
    }
    assert!(!table.contains("example.com"));
  }

  #[tokio::test]
  async fn test_wait_times_out_while_owner_runs() {
    let table = WaitTable::new();
    let _owner = match table.acquire("example.com") {
      Acquired::Owner(slot) => slot,
      Acquired::Waiter(_) => panic!("first acquire should own"),
    };
    let rx = match table.acquire("example.com") {
      Acquired::Waiter(rx) => rx,
      Acquired::Owner(_) => panic!("entry already taken"),
    };
    assert!(wait_for_signal(rx, Duration::from_millis(50)).await.is_err());
  }

  #[tokio::test]
  async fn test_concurrent_acquire_mutual_exclusion() {
    let table = Arc::new(WaitTable::new());
    let active = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..64 {
      let table = Arc::clone(&table);
      let active = Arc::clone(&active);
      handles.push(tokio::spawn(async move {
        match table.acquire("example.com") {
          Acquired::Owner(slot) => {
            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "two concurrent owners");
            tokio::time::sleep(Duration::from_millis(20)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            drop(slot);
          }
          Acquired::Waiter(rx) => {
            wait_for_signal(rx, Duration::from_secs(5)).await.unwrap();
          }
        }
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }
  }
}
