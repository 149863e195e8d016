use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// index name -> expiry; `None` never expires.
type Indexes = HashMap<String, Option<Instant>>;

/// Remembers which indexes were ensured recently so repeated `ensure_index` calls can be
/// skipped until the entry expires.
#[derive(Debug, Default)]
pub(crate) struct IndexCache {
    /// database -> collection -> indexes
    entries: Mutex<HashMap<String, HashMap<String, Indexes>>>,
}

impl IndexCache {
    /// Records an index for `ttl`; a ttl too large to represent keeps the entry until it is
    /// purged. Returns false if it was already cached and unexpired.
    pub fn cache(&self, database: &str, collection: &str, index: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let indexes = entries
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        if indexes.get(index).is_some_and(|expiry| live(*expiry, now)) {
            return false;
        }
        indexes.insert(index.to_string(), now.checked_add(ttl));
        true
    }

    pub fn is_cached(&self, database: &str, collection: &str, index: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(database)
            .and_then(|collections| collections.get(collection))
            .and_then(|indexes| indexes.get(index))
            .is_some_and(|expiry| live(*expiry, now))
    }

    /// Forgets a whole database, one collection, or a single index.
    pub fn purge(&self, database: &str, collection: Option<&str>, index: Option<&str>) {
        let mut entries = self.entries.lock();
        let Some(collection) = collection else {
            entries.remove(database);
            return;
        };
        let Some(collections) = entries.get_mut(database) else {
            return;
        };
        match index {
            None => {
                collections.remove(collection);
            }
            Some(index) => {
                if let Some(indexes) = collections.get_mut(collection) {
                    indexes.remove(index);
                }
            }
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn live(expiry: Option<Instant>, now: Instant) -> bool {
    expiry.is_none_or(|expiry| expiry > now)
}
