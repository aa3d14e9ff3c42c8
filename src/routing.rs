//! Routing snapshots
//!
//! A [`RoutingSnapshot`] is built from the domain database and never
//! changes afterwards. The [`RoutingTable`] publishes the current snapshot
//! behind an atomic pointer: every request loads it once without locking,
//! and a reload swaps in a complete replacement.

use crate::database::{normalize_domain, DbError, DomainDatabase};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Where requests for a domain go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The local management surface
    Management,
    /// A forwarded backend
    Backend(Url),
}

/// Immutable `domain -> route` view
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    routes: HashMap<String, Route>,
}

impl RoutingSnapshot {
    /// Build a snapshot from the database plus the management domain
    ///
    /// The management domain always wins over a database entry of the
    /// same name.
    pub fn build(db: &DomainDatabase, management_domain: Option<&str>) -> Self {
        let mut routes: HashMap<String, Route> = db
            .snapshot()
            .values()
            .map(|record| (record.domain.clone(), Route::Backend(record.backend.clone())))
            .collect();

        if let Some(domain) = management_domain {
            routes.insert(domain.to_string(), Route::Management);
        }

        Self { routes }
    }

    /// Route for a host name (case-insensitive, optional trailing dot)
    ///
    /// An exact entry wins over a `*.parent` wildcard entry.
    pub fn route(&self, host: &str) -> Option<&Route> {
        if let Some(route) = self.routes.get(host) {
            return Some(route);
        }
        let host = normalize_domain(host).ok()?;
        self.routes.get(&host).or_else(|| {
            let (_, parent) = host.split_once('.')?;
            self.routes.get(&format!("*.{}", parent))
        })
    }

    pub fn contains(&self, host: &str) -> bool {
        self.route(host).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routed domain names, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.routes.keys().cloned().collect();
        domains.sort();
        domains
    }
}

/// Atomically swappable routing table
pub struct RoutingTable {
    db: Arc<DomainDatabase>,
    management_domain: Option<String>,
    current: ArcSwap<RoutingSnapshot>,
    reload_lock: Mutex<()>,
    reloading: AtomicBool,
}

impl RoutingTable {
    /// Create the table with its initial snapshot
    pub fn new(db: Arc<DomainDatabase>, management_domain: Option<&str>) -> Result<Self, DbError> {
        let management_domain = management_domain.map(normalize_domain).transpose()?;
        let snapshot = RoutingSnapshot::build(&db, management_domain.as_deref());

        Ok(Self {
            db,
            management_domain,
            current: ArcSwap::from_pointee(snapshot),
            reload_lock: Mutex::new(()),
            reloading: AtomicBool::new(false),
        })
    }

    /// Current snapshot; hold on to it for the lifetime of a request
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    pub fn database(&self) -> &Arc<DomainDatabase> {
        &self.db
    }

    pub fn management_domain(&self) -> Option<&str> {
        self.management_domain.as_deref()
    }

    /// Whether a snapshot swap is executing right now
    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::Acquire)
    }

    /// Re-read the database and publish a new snapshot
    ///
    /// Reloads are serialized against each other; readers are never blocked.
    /// On a database error the previous snapshot stays active.
    pub fn reload(&self) -> Result<usize, DbError> {
        let _guard = self.reload_lock.lock();
        self.reloading.store(true, Ordering::Release);

        let result = self.db.reload().map(|_| {
            let snapshot = RoutingSnapshot::build(&self.db, self.management_domain.as_deref());
            let count = snapshot.len();
            self.current.store(Arc::new(snapshot));
            count
        });

        self.reloading.store(false, Ordering::Release);

        if let Ok(count) = result {
            info!("routing table reloaded with {} domain(s)", count);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Owner;
    use std::collections::BTreeSet;
    use std::thread;
    use tempfile::tempdir;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snapshot_routes() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DomainDatabase::open(dir.path().join("domains.db"), true).unwrap());
        db.upsert("app.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();

        let table = RoutingTable::new(db, Some("Admin.Example.com")).unwrap();
        let snapshot = table.snapshot();

        assert_eq!(snapshot.route("admin.example.com"), Some(&Route::Management));
        assert_eq!(
            snapshot.route("APP.example.com."),
            Some(&Route::Backend(Url::parse("http://127.0.0.1:9000").unwrap()))
        );
        assert!(!snapshot.contains("unknown.example.com"));
        assert_eq!(snapshot.domains(), vec!["admin.example.com", "app.example.com"]);
    }

    #[test]
    fn test_wildcard_route() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DomainDatabase::open(dir.path().join("domains.db"), true).unwrap());
        db.upsert("*.apps.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
        db.upsert("special.apps.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();

        let table = RoutingTable::new(db, None).unwrap();
        let snapshot = table.snapshot();

        assert_eq!(
            snapshot.route("one.apps.example.com"),
            Some(&Route::Backend(Url::parse("http://127.0.0.1:9000").unwrap()))
        );
        assert_eq!(
            snapshot.route("special.apps.example.com"),
            Some(&Route::Backend(Url::parse("http://127.0.0.1:9001").unwrap()))
        );
        // one level only
        assert!(!snapshot.contains("a.b.apps.example.com"));
        assert!(!snapshot.contains("apps.example.com"));
    }

    #[test]
    fn test_old_snapshot_unchanged_after_reload() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DomainDatabase::open(dir.path().join("domains.db"), true).unwrap());
        db.upsert("a.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();

        let table = RoutingTable::new(db.clone(), None).unwrap();
        let before = table.snapshot();

        db.upsert("b.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();
        assert!(!table.snapshot().contains("b.example.com"));

        assert_eq!(table.reload().unwrap(), 2);
        assert!(table.snapshot().contains("b.example.com"));
        assert_eq!(before.domains(), vec!["a.example.com"]);
        assert!(!table.is_reloading());
    }

    #[test]
    fn test_readers_never_see_mixed_tables() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DomainDatabase::open(dir.path().join("domains.db"), true).unwrap());
        db.upsert("a.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
        db.upsert("b.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();

        let table = Arc::new(RoutingTable::new(db.clone(), None).unwrap());
        let old = set(&["a.example.com", "b.example.com"]);
        let new = set(&["a.example.com", "c.example.com"]);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let (old, new) = (old.clone(), new.clone());
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let seen: BTreeSet<String> = table.snapshot().domains().into_iter().collect();
                        assert!(seen == old || seen == new, "mixed table observed: {:?}", seen);
                    }
                })
            })
            .collect();

        for i in 0..20 {
            if i % 2 == 0 {
                db.remove("b.example.com").unwrap();
                db.upsert("c.example.com", "http://127.0.0.1:9002", Owner::Local).unwrap();
            } else {
                db.remove("c.example.com").unwrap();
                db.upsert("b.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();
            }
            table.reload().unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
