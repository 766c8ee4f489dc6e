//! Per-scope mutual exclusion.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

/// One async mutex per (account, instrument) scope.
///
/// Guards the scope-level invariant: at most one in-flight rebuild, validate,
/// or repair per scope. Locks for different scopes are independent, so a
/// batch rebuild fans out freely across scopes.
#[derive(Default)]
pub struct ScopeLocks {
    inner: StdMutex<BTreeMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for a scope, created on first use.
    pub fn lock_for(&self, account: &str, instrument: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("scope lock registry poisoned");
        map.entry((account.to_string(), instrument.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
