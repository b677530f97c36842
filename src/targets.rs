//! Target Registry: engines for the user-chosen SQL targets
//!
//! Opens and caches one engine per target id. Connection strings are
//! canonicalized (file paths become absolute, `sqlite:` URLs are
//! unwrapped). Only the embedded sqlite driver is bundled; the other
//! providers keep their dialect metadata for planning but fail `test()`
//! until a driver is deployed alongside the agent.

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use crate::models::{DbProvider, DbTarget, TargetStatus};
use log::{debug, info};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A live connection to one target database
#[derive(Debug)]
pub struct TargetEngine {
    provider: DbProvider,
    conn: Mutex<Connection>,
    descriptor: String,
}

impl TargetEngine {
    fn open_sqlite(conn_str: &str) -> AppResult<Self> {
        let conn = if conn_str == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = resolve_sqlite_path(conn_str);
            Connection::open(&path).map_err(|e| AppError::DbTargetUnreachable {
                message: format!("{}: {}", path.display(), e),
            })?
        };
        Ok(Self {
            provider: DbProvider::Sqlite,
            conn: Mutex::new(conn),
            descriptor: conn_str.to_string(),
        })
    }

    pub fn provider(&self) -> DbProvider {
        self.provider
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Run `f` with the underlying connection
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::database("target engine lock poisoned"))?;
        f(&conn)
    }

    /// Run `f` inside a single transaction; rolls back on error
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AppError::database("target engine lock poisoned"))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Physical table names visible in the target
    pub fn list_tables(&self) -> AppResult<Vec<String>> {
        self.with_conn(|c| {
            let mut stmt =
                c.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    pub fn has_table(&self, name: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn columns_of(&self, name: &str) -> AppResult<Vec<String>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!("PRAGMA table_info({})", name))?;
            let cols = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(cols)
        })
    }
}

/// Canonicalize a sqlite connection string to an absolute filesystem path
pub fn resolve_sqlite_path(conn: &str) -> PathBuf {
    let raw = conn
        .strip_prefix("sqlite:///")
        .or_else(|| conn.strip_prefix("sqlite://"))
        .or_else(|| conn.strip_prefix("sqlite:"))
        .unwrap_or(conn);
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Opens/validates connections to targets; caches engines by id
pub struct TargetRegistry {
    catalog: Arc<CatalogStore>,
    engines: Mutex<HashMap<String, Arc<TargetEngine>>>,
}

impl TargetRegistry {
    pub fn new(catalog: Arc<CatalogStore>) -> Self {
        Self {
            catalog,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Engine for a target id, or for the default target when `None`
    pub fn engine_for_target(&self, target_id: Option<&str>) -> AppResult<Arc<TargetEngine>> {
        let id = match target_id {
            Some(id) => id.to_string(),
            None => self
                .catalog
                .default_target_id()
                .ok_or_else(|| AppError::not_found("target", "(default)", "TARGET_NOT_FOUND"))?,
        };
        {
            let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(engine) = engines.get(&id) {
                return Ok(engine.clone());
            }
        }
        let target = self
            .catalog
            .get_target(&id)
            .ok_or_else(|| AppError::not_found("target", &id, "TARGET_NOT_FOUND"))?;
        let engine = Arc::new(self.open(&target)?);
        debug!("target engine opened: {} ({})", id, engine.descriptor());
        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, engine.clone());
        Ok(engine)
    }

    /// Drop a cached engine (after target deletion or a config change)
    pub fn evict(&self, target_id: &str) {
        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target_id);
    }

    fn open(&self, target: &DbTarget) -> AppResult<TargetEngine> {
        match target.provider {
            DbProvider::Sqlite => TargetEngine::open_sqlite(&target.conn),
            other => Err(AppError::TestFailed {
                message: format!("{} driver is not bundled with this agent build", other),
            }),
        }
    }

    /// Minimal connect test; persists status/last_message on the target
    pub fn test(&self, target_id: Option<&str>, adhoc: Option<DbTarget>) -> AppResult<DbTarget> {
        let target = match target_id {
            Some(id) => self
                .catalog
                .get_target(id)
                .ok_or_else(|| AppError::not_found("target", id, "TARGET_NOT_FOUND"))?,
            None => adhoc.ok_or_else(|| AppError::required("target", "TARGET_NOT_FOUND"))?,
        };
        let keep_id = Some(target.id.clone()).filter(|id| !id.is_empty());
        match self.open(&target) {
            Ok(engine) => {
                engine.with_conn(|c| {
                    c.query_row("SELECT 1", [], |_| Ok(()))?;
                    Ok(())
                })?;
                info!("target test ok: {} {}", target.provider, target.conn);
                self.catalog.add_target(
                    keep_id,
                    target.provider,
                    &target.conn,
                    Some(TargetStatus::Ok),
                    Some("Test OK".into()),
                )
            }
            Err(e) => {
                let message = e.to_string();
                self.catalog.add_target(
                    keep_id,
                    target.provider,
                    &target.conn,
                    Some(TargetStatus::Fail),
                    Some(message.clone()),
                )?;
                Err(AppError::DbTargetUnreachable { message })
            }
        }
    }

    /// Materialize the database file for a sqlite target
    pub fn create_db(&self, target_id: &str) -> AppResult<()> {
        let target = self
            .catalog
            .get_target(target_id)
            .ok_or_else(|| AppError::not_found("target", target_id, "TARGET_NOT_FOUND"))?;
        if target.provider != DbProvider::Sqlite {
            return Err(AppError::TestFailed {
                message: "only sqlite databases can be created by the agent".into(),
            });
        }
        let engine = TargetEngine::open_sqlite(&target.conn)?;
        engine.with_conn(|c| {
            c.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::appdb::AppDb;

    fn registry() -> (Arc<CatalogStore>, TargetRegistry) {
        let catalog = Arc::new(CatalogStore::new(Arc::new(AppDb::open_in_memory().unwrap())).unwrap());
        let registry = TargetRegistry::new(catalog.clone());
        (catalog, registry)
    }

    #[test]
    fn sqlite_path_canonicalization() {
        assert!(resolve_sqlite_path("sqlite:///tmp/x.db").is_absolute());
        assert!(resolve_sqlite_path("relative.db").is_absolute());
        assert_eq!(
            resolve_sqlite_path("/data/plc.db"),
            PathBuf::from("/data/plc.db")
        );
    }

    #[test]
    fn engines_are_cached_by_target_id() {
        let (catalog, registry) = registry();
        let target = catalog
            .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
            .unwrap();
        let a = registry.engine_for_target(Some(&target.id)).unwrap();
        let b = registry.engine_for_target(Some(&target.id)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // cached in-memory engine keeps its contents across lookups
        a.with_conn(|c| {
            c.execute("CREATE TABLE probe (x INTEGER)", [])?;
            Ok(())
        })
        .unwrap();
        assert!(b.has_table("probe").unwrap());
    }

    #[test]
    fn default_target_resolution() {
        let (catalog, registry) = registry();
        assert_eq!(
            registry.engine_for_target(None).unwrap_err().code(),
            "TARGET_NOT_FOUND"
        );
        let target = catalog
            .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
            .unwrap();
        catalog.set_default_target(&target.id).unwrap();
        assert!(registry.engine_for_target(None).is_ok());
    }

    #[test]
    fn test_persists_status() {
        let (catalog, registry) = registry();
        let target = catalog
            .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
            .unwrap();
        let tested = registry.test(Some(&target.id), None).unwrap();
        assert_eq!(tested.status, TargetStatus::Ok);
        assert_eq!(tested.last_msg.as_deref(), Some("Test OK"));

        let pg = catalog
            .add_target(
                None,
                DbProvider::Postgres,
                "postgres://user@host/db",
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            registry.test(Some(&pg.id), None).unwrap_err().code(),
            "DB_TARGET_UNREACHABLE"
        );
        assert_eq!(
            catalog.get_target(&pg.id).unwrap().status,
            TargetStatus::Fail
        );
    }
}
