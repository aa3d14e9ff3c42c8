//! Domain database backed by SQLite
//!
//! Holds the durable `domain -> backend` mapping together with the entity
//! that owns each domain. Readers work from an immutable in-memory snapshot
//! that is republished after every committed write, so lookups never touch
//! the connection and never observe a half-applied change.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const LOCAL_OWNER: &str = "self";

/// Errors raised by the domain database
#[derive(Error, Debug)]
pub enum DbError {
    #[error("domain database {0} does not exist")]
    MissingStore(PathBuf),

    #[error("domain '{0}' not found")]
    NotFound(String),

    #[error("invalid domain name '{0}'")]
    InvalidDomain(String),

    #[error("invalid backend '{backend}': {reason}")]
    InvalidBackend { backend: String, reason: String },

    #[error("domain '{domain}' is already owned by {owner}")]
    Conflict { domain: String, owner: Owner },

    #[error("corrupt record for '{domain}': {reason}")]
    Corrupt { domain: String, reason: String },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Entity a domain belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Configured on this proxy
    Local,
    /// Pushed by a chained child, identified by its forward-to URL
    Child(String),
}

impl Owner {
    pub fn child(forward_to: &Url) -> Self {
        Owner::Child(forward_to.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Owner::Local => LOCAL_OWNER,
            Owner::Child(id) => id,
        }
    }

    fn from_stored(value: String) -> Self {
        if value == LOCAL_OWNER {
            Owner::Local
        } else {
            Owner::Child(value)
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Local => f.write_str(LOCAL_OWNER),
            Owner::Child(id) => write!(f, "child {}", id),
        }
    }
}

/// A single routed domain
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub domain: String,
    pub backend: Url,
    pub owner: Owner,
    pub updated_at: String,
}

/// Outcome of replacing the domain set of one owner
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Immutable view of every record, ordered by domain
pub type DomainSnapshot = Arc<BTreeMap<String, DomainRecord>>;

/// Durable domain database
///
/// Writes are serialized on the connection mutex and committed before the
/// call returns; reads come from the published snapshot.
pub struct DomainDatabase {
    conn: Mutex<Connection>,
    records: ArcSwap<BTreeMap<String, DomainRecord>>,
    path: PathBuf,
}

impl DomainDatabase {
    /// Open the database at `path`
    ///
    /// A missing file is an error unless `auto_create` is set.
    pub fn open<P: AsRef<Path>>(path: P, auto_create: bool) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if !auto_create {
                return Err(DbError::MissingStore(path));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if auto_create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(&path, flags)?;

        // WAL keeps readers of other processes unblocked, FULL syncs each commit
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::initialize(&conn)?;

        let records = Self::load_all(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            records: ArcSwap::from_pointee(records),
            path,
        })
    }

    fn initialize(conn: &Connection) -> Result<(), DbError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS domains (
                name TEXT PRIMARY KEY,
                backend TEXT NOT NULL,
                owner TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_domains_owner ON domains(owner)",
            [],
        )?;

        Ok(())
    }

    fn load_all(conn: &Connection) -> Result<BTreeMap<String, DomainRecord>, DbError> {
        let mut stmt = conn.prepare(
            "SELECT name, backend, owner, updated_at FROM domains ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;

        let mut records = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let domain: String = row.get(0)?;
            let backend: String = row.get(1)?;
            let backend = Url::parse(&backend).map_err(|e| DbError::Corrupt {
                domain: domain.clone(),
                reason: e.to_string(),
            })?;

            records.insert(
                domain.clone(),
                DomainRecord {
                    domain,
                    backend,
                    owner: Owner::from_stored(row.get(2)?),
                    updated_at: row.get(3)?,
                },
            );
        }

        Ok(records)
    }

    fn current_owner(conn: &Connection, domain: &str) -> Result<Option<Owner>, DbError> {
        let owner = conn
            .query_row(
                "SELECT owner FROM domains WHERE name = ?1",
                params![domain],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        Ok(owner.map(Owner::from_stored))
    }

    fn write_record(
        conn: &Connection,
        domain: &str,
        backend: &Url,
        owner: &Owner,
    ) -> Result<String, DbError> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO domains (name, backend, owner, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                backend = excluded.backend,
                owner = excluded.owner,
                updated_at = excluded.updated_at",
            params![
                domain,
                backend.as_str(),
                owner.as_str(),
                updated_at
            ],
        )?;
        Ok(updated_at)
    }

    /// Republish the snapshot from what is committed on disk
    fn publish(&self, conn: &Connection) -> Result<usize, DbError> {
        let records = Self::load_all(conn)?;
        let count = records.len();
        self.records.store(Arc::new(records));
        Ok(count)
    }

    /// Republish after a commit
    ///
    /// The write is durable at this point, so a failed re-read only leaves
    /// the previous snapshot in place until the next reload.
    fn publish_committed(&self, conn: &Connection) {
        if let Err(e) = self.publish(conn) {
            warn!("write committed but snapshot refresh failed: {}", e);
        }
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of known domains
    pub fn count(&self) -> usize {
        self.records.load().len()
    }

    /// Known domain names in ascending order
    pub fn names(&self) -> Vec<String> {
        self.records.load().keys().cloned().collect()
    }

    /// Current snapshot of every record
    pub fn snapshot(&self) -> DomainSnapshot {
        self.records.load_full()
    }

    /// Backend a domain is routed to
    pub fn lookup(&self, domain: &str) -> Result<Url, DbError> {
        self.record(domain).map(|r| r.backend)
    }

    /// Full record for a domain
    pub fn record(&self, domain: &str) -> Result<DomainRecord, DbError> {
        let domain = normalize_domain(domain)?;
        self.records
            .load()
            .get(&domain)
            .cloned()
            .ok_or(DbError::NotFound(domain))
    }

    /// Insert or update a domain on behalf of `owner`
    ///
    /// Fails with [`DbError::Conflict`] if another owner holds the domain.
    pub fn upsert(&self, domain: &str, backend: &str, owner: Owner) -> Result<DomainRecord, DbError> {
        let domain = normalize_domain(domain)?;
        let backend = parse_backend(backend)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(current) = Self::current_owner(&tx, &domain)? {
            if current != owner {
                return Err(DbError::Conflict { domain, owner: current });
            }
        }

        let updated_at = Self::write_record(&tx, &domain, &backend, &owner)?;
        tx.commit()?;
        self.publish_committed(&conn);

        debug!(domain = %domain, backend = %backend, owner = %owner, "domain upserted");

        Ok(DomainRecord {
            domain,
            backend,
            owner,
            updated_at,
        })
    }

    /// Remove a domain, returning whether it existed
    pub fn remove(&self, domain: &str) -> Result<bool, DbError> {
        let domain = normalize_domain(domain)?;

        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM domains WHERE name = ?1", params![domain])?;
        self.publish_committed(&conn);

        debug!(domain = %domain, removed = affected > 0, "domain removed");
        Ok(affected > 0)
    }

    /// Replace exactly the set of domains held by `owner`
    ///
    /// All domains are routed to `backend`. Domains held by other owners are
    /// never touched; claiming one aborts the whole replacement.
    pub fn replace_owned(
        &self,
        owner: &Owner,
        domains: &[String],
        backend: &str,
    ) -> Result<ReplaceSummary, DbError> {
        let wanted = domains
            .iter()
            .map(|d| normalize_domain(d))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let backend = parse_backend(backend)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut summary = ReplaceSummary::default();
        for domain in &wanted {
            match Self::current_owner(&tx, domain)? {
                Some(current) if current != *owner => {
                    return Err(DbError::Conflict {
                        domain: domain.clone(),
                        owner: current,
                    });
                }
                Some(_) => summary.updated += 1,
                None => summary.added += 1,
            }
        }

        let held: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM domains WHERE owner = ?1")?;
            let names = stmt.query_map(params![owner.as_str()], |row| row.get(0))?;
            let held = names.collect::<Result<Vec<String>, _>>()?;
            held
        };

        for domain in held.iter().filter(|d| !wanted.contains(*d)) {
            tx.execute("DELETE FROM domains WHERE name = ?1", params![domain])?;
            summary.removed += 1;
        }

        for domain in &wanted {
            Self::write_record(&tx, domain, &backend, owner)?;
        }

        tx.commit()?;
        self.publish_committed(&conn);

        debug!(
            owner = %owner,
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            "owned domains replaced"
        );

        Ok(summary)
    }

    /// Re-read the store, picking up changes made by other processes
    pub fn reload(&self) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        self.publish(&conn)
    }
}

/// Canonical form of a domain name
///
/// Lower-cases, drops one trailing dot and checks DNS label syntax. A
/// leading `*.` wildcard label is accepted.
pub fn normalize_domain(domain: &str) -> Result<String, DbError> {
    let invalid = || DbError::InvalidDomain(domain.to_string());

    let name = domain.trim().to_ascii_lowercase();
    let name = name.strip_suffix('.').unwrap_or(&name).to_string();

    if name.is_empty() || name.len() > 253 {
        return Err(invalid());
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 && name != "localhost" {
        return Err(invalid());
    }

    for (i, label) in labels.iter().enumerate() {
        if i == 0 && *label == "*" {
            continue;
        }
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !valid {
            return Err(invalid());
        }
    }

    Ok(name)
}

/// Parse a backend target
///
/// Accepts an absolute http(s) URL or a bare `host:port`, which is taken
/// as plain http.
pub fn parse_backend(backend: &str) -> Result<Url, DbError> {
    let raw = backend.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let invalid = |reason: String| DbError::InvalidBackend {
        backend: backend.to_string(),
        reason,
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn child(url: &str) -> Owner {
        Owner::child(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_open_missing_without_auto_create() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("domains.db");

        let err = DomainDatabase::open(&db_path, false).err().unwrap();
        assert!(matches!(err, DbError::MissingStore(_)));
        assert!(!db_path.exists());
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("domains.db");
        let db = DomainDatabase::open(&db_path, true).unwrap();
        assert!(db_path.exists());
        assert_eq!(db.count(), 0);

        drop(db);
        assert!(DomainDatabase::open(&db_path, false).is_ok());
    }

    #[test]
    fn test_upsert_and_lookup() {
        let dir = tempdir().unwrap();
        let db = DomainDatabase::open(dir.path().join("domains.db"), true).unwrap();

        db.upsert("App.Example.com.", "127.0.0.1:9000", Owner::Local).unwrap();

        let backend = db.lookup("app.example.com").unwrap();
        assert_eq!(backend.as_str(), "http://127.0.0.1:9000/");
        assert_eq!(db.lookup("APP.EXAMPLE.COM").unwrap(), backend);
        assert!(matches!(db.lookup("other.example.com"), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_names_deduplicated_and_ordered() {
        let dir = tempdir().unwrap();
        let db = DomainDatabase::open(dir.path().join("domains.db"), true).unwrap();

        db.upsert("b.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();
        db.upsert("a.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
        db.upsert("A.example.com", "http://127.0.0.1:9002", Owner::Local).unwrap();

        assert_eq!(db.names(), vec!["a.example.com", "b.example.com"]);
        assert_eq!(db.lookup("a.example.com").unwrap().port(), Some(9002));
    }

    #[test]
    fn test_names_survive_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("domains.db");

        let before = {
            let db = DomainDatabase::open(&db_path, true).unwrap();
            db.upsert("a.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
            db.upsert("b.example.com", "http://127.0.0.1:9001", Owner::Local).unwrap();
            db.upsert("c.example.com", "http://127.0.0.1:9002", Owner::Local).unwrap();
            assert!(db.remove("b.example.com").unwrap());
            assert!(!db.remove("b.example.com").unwrap());
            db.names()
        };

        let db = DomainDatabase::open(&db_path, false).unwrap();
        assert_eq!(db.names(), before);
        assert_eq!(before, vec!["a.example.com", "c.example.com"]);
    }

    #[test]
    fn test_upsert_conflicting_owner() {
        let dir = tempdir().unwrap();
        let db = DomainDatabase::open(dir.path().join("domains.db"), true).unwrap();

        db.upsert("a.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
        let err = db
            .upsert("a.example.com", "https://child.example.com", child("https://child.example.com"))
            .unwrap_err();

        assert!(matches!(err, DbError::Conflict { owner: Owner::Local, .. }));
        assert_eq!(db.lookup("a.example.com").unwrap().port(), Some(9000));
    }

    #[test]
    fn test_replace_owned_only_touches_owner() {
        let dir = tempdir().unwrap();
        let db = DomainDatabase::open(dir.path().join("domains.db"), true).unwrap();
        let one = child("https://one.example.com");
        let two = child("https://two.example.com");

        db.upsert("local.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();
        db.replace_owned(&two, &["z.example.com".to_string()], "https://two.example.com")
            .unwrap();

        let summary = db
            .replace_owned(
                &one,
                &["a.example.com".to_string(), "b.example.com".to_string()],
                "https://one.example.com",
            )
            .unwrap();
        assert_eq!(summary.added, 2);

        let summary = db
            .replace_owned(
                &one,
                &["b.example.com".to_string(), "c.example.com".to_string()],
                "https://one.example.com",
            )
            .unwrap();
        assert_eq!(summary, ReplaceSummary { added: 1, updated: 1, removed: 1 });

        assert_eq!(
            db.names(),
            vec!["b.example.com", "c.example.com", "local.example.com", "z.example.com"]
        );
        assert_eq!(db.record("z.example.com").unwrap().owner, two);
        assert_eq!(db.record("local.example.com").unwrap().owner, Owner::Local);
    }

    #[test]
    fn test_replace_owned_conflict_changes_nothing() {
        let dir = tempdir().unwrap();
        let db = DomainDatabase::open(dir.path().join("domains.db"), true).unwrap();
        let one = child("https://one.example.com");
        let two = child("https://two.example.com");

        db.replace_owned(&one, &["a.example.com".to_string()], "https://one.example.com")
            .unwrap();
        let before = db.snapshot();

        let err = db
            .replace_owned(
                &two,
                &["new.example.com".to_string(), "a.example.com".to_string()],
                "https://two.example.com",
            )
            .unwrap_err();

        assert!(matches!(err, DbError::Conflict { ref domain, .. } if domain == "a.example.com"));
        assert_eq!(*db.snapshot(), *before);
    }

    #[test]
    fn test_reload_sees_other_writer() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("domains.db");
        let db = DomainDatabase::open(&db_path, true).unwrap();

        let tool = DomainDatabase::open(&db_path, false).unwrap();
        tool.upsert("late.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();

        assert_eq!(db.count(), 0);
        assert_eq!(db.reload().unwrap(), 1);
        assert_eq!(db.names(), vec!["late.example.com"]);
    }

    #[test]
    fn test_committed_write_survives_failed_refresh() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("domains.db");
        let db = DomainDatabase::open(&db_path, true).unwrap();

        // a row no snapshot can be built from
        let raw = Connection::open(&db_path).unwrap();
        raw.execute(
            "INSERT INTO domains (name, backend, owner, updated_at) VALUES ('broken.example.com', 'not a url', 'self', '')",
            [],
        )
        .unwrap();

        let record = db
            .upsert("app.example.com", "http://127.0.0.1:9000", Owner::Local)
            .unwrap();
        assert_eq!(record.domain, "app.example.com");
        assert!(db.remove("app.example.com").unwrap());
        db.upsert("kept.example.com", "http://127.0.0.1:9001", Owner::Local)
            .unwrap();

        let stored: i64 = raw
            .query_row(
                "SELECT COUNT(*) FROM domains WHERE name = 'kept.example.com'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, 1);
        assert!(matches!(db.reload(), Err(DbError::Corrupt { .. })));
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain(" Example.COM. ").unwrap(), "example.com");
        assert_eq!(normalize_domain("*.example.com").unwrap(), "*.example.com");
        assert_eq!(normalize_domain("localhost").unwrap(), "localhost");
        assert!(normalize_domain("example").is_err());
        assert!(normalize_domain("-bad.example.com").is_err());
        assert!(normalize_domain("bad_label.example.com").is_err());
        assert!(normalize_domain("a..example.com").is_err());
        assert!(normalize_domain("../etc/passwd").is_err());
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend("10.0.0.5:8080").unwrap().as_str(), "http://10.0.0.5:8080/");
        assert_eq!(
            parse_backend("https://child.example.com").unwrap(),
            Url::parse("https://child.example.com").unwrap()
        );
        assert!(parse_backend("ftp://files.example.com").is_err());
        assert!(parse_backend("").is_err());
    }
}
