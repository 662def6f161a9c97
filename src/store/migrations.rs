//! Versioned, transactional schema migrations.
//!
//! Adapted from the storage-migration pattern: an append-only
//! `schema_migrations` table records which versions have been applied;
//! pending migrations run inside a single exclusive transaction so a
//! failure partway through leaves the schema untouched.

use rusqlite::Connection;

use crate::error::{Error, Result};

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "initial_schema",
            sql: r#"
                CREATE TABLE devices (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    ip_address TEXT NOT NULL UNIQUE,
                    device_type TEXT NOT NULL,
                    vendor TEXT NOT NULL,
                    username TEXT NOT NULL,
                    password_encrypted BLOB NOT NULL,
                    ssh_port INTEGER NOT NULL DEFAULT 22,
                    snmp_community TEXT,
                    tags TEXT,
                    status TEXT NOT NULL DEFAULT 'unknown',
                    last_checked TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE check_results (
                    id TEXT PRIMARY KEY,
                    device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                    check_name TEXT NOT NULL,
                    check_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL,
                    evidence TEXT NOT NULL,
                    checked_at TEXT NOT NULL
                );

                CREATE INDEX idx_check_results_device_id ON check_results(device_id);

                CREATE TABLE security_rules (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    vendor TEXT NOT NULL,
                    command TEXT NOT NULL,
                    expected_pattern TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE(name, vendor)
                );

                CREATE TABLE app_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
            "#,
        },
    ]
}

pub fn run(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::Database(e.to_string()))?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(());
    }

    conn.execute_batch("BEGIN EXCLUSIVE TRANSACTION;")
        .map_err(|e| Error::Database(e.to_string()))?;

    for migration in &pending {
        if let Err(e) = conn.execute_batch(migration.sql) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(Error::Database(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.name
            )));
        }
        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.name, now],
        ) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(Error::Database(e.to_string()));
        }
    }

    conn.execute_batch("COMMIT;")
        .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    let exists: bool = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )
        .map_err(|e| Error::Database(e.to_string()))?;
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, u32>(0),
    )
    .map_err(|e| Error::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_twice_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let migrations = all();
        run(&conn, &migrations).unwrap();
        let after_first = current_version(&conn).unwrap();
        run(&conn, &migrations).unwrap();
        let after_second = current_version(&conn).unwrap();
        assert_eq!(after_first, after_second);

        let count: i64 = conn
            .query_row("SELECT count(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as u32, after_first);
    }

    #[test]
    fn creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn, &all()).unwrap();
        for table in [
            "devices",
            "check_results",
            "security_rules",
            "app_settings",
            "schema_migrations",
        ] {
            let exists: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    rusqlite::params![table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "missing table {table}");
        }
    }
}
