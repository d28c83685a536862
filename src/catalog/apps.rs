use std::collections::HashSet;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::store::apps::AppRepository;
use crate::store::Database;

type AppKey = (String, Option<String>);

/// Interns `(process_name, bundle_id)` pairs into stable app ids.
///
/// The cache is unbounded on purpose: the key space is the set of
/// distinct applications on one host, tens to hundreds of entries.
/// Re-sightings are debounced into a pending set that the scheduler tick
/// flushes as a single `last_seen` batch, so the sampler never writes
/// application rows on its hot path.
pub struct AppCatalog {
    db: Database,
    cache: DashMap<AppKey, i64>,
    pending_touch: Mutex<HashSet<i64>>,
}

impl AppCatalog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: DashMap::new(),
            pending_touch: Mutex::new(HashSet::new()),
        }
    }

    /// Resolves an identity to its app id, inserting on first sighting.
    pub async fn resolve(
        &self,
        process_name: &str,
        bundle_id: Option<&str>,
        now: i64,
    ) -> Result<i64> {
        let key: AppKey = (process_name.to_string(), bundle_id.map(str::to_string));

        if let Some(app_id) = self.cache.get(&key).map(|entry| *entry) {
            self.pending_touch.lock().insert(app_id);
            return Ok(app_id);
        }

        let (name_for_db, bundle_for_db) = key.clone();
        let app_id = self
            .db
            .execute(move |conn| {
                AppRepository::new(conn).intern(&name_for_db, bundle_for_db.as_deref(), now)
            })
            .await?;

        self.cache.insert(key, app_id);
        Ok(app_id)
    }

    /// Writes the accumulated `last_seen` advances in one batch.
    /// Returns how many apps were touched.
    pub async fn flush_last_seen(&self, now: i64) -> Result<usize> {
        let ids: Vec<i64> = {
            let mut pending = self.pending_touch.lock();
            pending.drain().collect()
        };

        if ids.is_empty() {
            return Ok(0);
        }

        let count = ids.len();
        self.db
            .execute(move |conn| AppRepository::new(conn).touch_last_seen(&ids, now))
            .await?;
        Ok(count)
    }

    /// Number of identities currently cached.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::apps::AppRepository;

    #[tokio::test]
    async fn test_resolve_caches_and_is_stable() {
        let db = Database::open_in_memory().expect("open");
        let catalog = AppCatalog::new(db);

        let first = catalog.resolve("Safari", Some("com.apple.Safari"), 100).await.expect("resolve");
        let second = catalog.resolve("Safari", Some("com.apple.Safari"), 200).await.expect("resolve");

        assert_eq!(first, second);
        assert_eq!(catalog.cached(), 1);
    }

    #[tokio::test]
    async fn test_flush_last_seen_debounces() {
        let db = Database::open_in_memory().expect("open");
        let catalog = AppCatalog::new(db.clone());

        let app_id = catalog.resolve("curl", None, 100).await.expect("resolve");
        // Cache hits only mark the id; nothing written yet.
        catalog.resolve("curl", None, 110).await.expect("resolve");
        catalog.resolve("curl", None, 120).await.expect("resolve");

        let before = db
            .execute(move |conn| Ok(AppRepository::new(conn).get(app_id)?.expect("row")))
            .await
            .expect("get");
        assert_eq!(before.last_seen, 100);

        let touched = catalog.flush_last_seen(130).await.expect("flush");
        assert_eq!(touched, 1);

        let after = db
            .execute(move |conn| Ok(AppRepository::new(conn).get(app_id)?.expect("row")))
            .await
            .expect("get");
        assert_eq!(after.last_seen, 130);

        // Second flush with nothing pending is a no-op.
        assert_eq!(catalog.flush_last_seen(140).await.expect("flush"), 0);
    }
}
