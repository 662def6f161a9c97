//! Durable repository of devices, rules, results and settings.
//!
//! Built on `rusqlite` (bundled SQLite) rather than the async `sqlx`
//! pool seen elsewhere in the broader corpus, because the migration
//! runner this crate is grounded on (see `migrations.rs`) is
//! synchronous and transactional in a way that maps directly onto
//! `rusqlite::Connection`. Blocking calls are pushed onto
//! `spawn_blocking` so async callers (the Check Engine, the Device
//! Manager) are never blocked on SQLite I/O.

pub mod migrations;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::{JournalMode, StoreConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
    Warning,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Warning => "warning",
            DeviceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            "warning" => DeviceStatus::Warning,
            "error" => DeviceStatus::Error,
            _ => DeviceStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub device_type: String,
    pub vendor: String,
    pub username: String,
    /// Encrypted at rest; see `crypto`.
    pub password_encrypted: Vec<u8>,
    pub ssh_port: u16,
    pub snmp_community: Option<String>,
    pub tags: Vec<String>,
    pub status: DeviceStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub vendor: String,
    pub command: String,
    pub expected_pattern: String,
    pub severity: Severity,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub device_id: String,
    pub check_name: String,
    pub check_type: String,
    pub severity: Severity,
    pub status: CheckStatus,
    pub message: String,
    pub evidence: String,
    pub checked_at: DateTime<Utc>,
}

/// Owns the single SQLite connection. Shareable across async tasks via
/// `Arc`; every access takes the connection mutex so writers serialize
/// the way the busy-timeout expects.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.path)?;
        configure_connection(&conn, config)?;
        migrations::run(&conn, &migrations::all())?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(&config.path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run(&conn, &migrations::all())?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        f(&conn)
    }

    /// Runs a trivial `SELECT 1`, bounded to 5 seconds.
    pub async fn health_check(&self) -> Result<()> {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| Error::Database(e.to_string()))
        });
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(Error::Database(join_err.to_string())),
            Err(_) => Err(Error::Database("health check timed out".into())),
        }
    }

    /// Produces a consistent copy of the database at `dest` without
    /// stopping writers, using SQLite's online backup API.
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        self.with_conn(|conn| {
            let mut dst = Connection::open(dest.as_ref())?;
            let backup = rusqlite::backup::Backup::new(conn, &mut dst)
                .map_err(|e| Error::Database(e.to_string()))?;
            backup
                .run_to_completion(5, Duration::from_millis(250), None)
                .map_err(|e| Error::Database(e.to_string()))?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- devices -----------------------------------------------------

    pub fn insert_device(&self, device: &Device) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (
                    id, name, ip_address, device_type, vendor, username,
                    password_encrypted, ssh_port, snmp_community, tags,
                    status, last_checked, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    device.id,
                    device.name,
                    device.ip_address,
                    device.device_type,
                    device.vendor,
                    device.username,
                    device.password_encrypted,
                    device.ssh_port,
                    device.snmp_community,
                    encode_tags(&device.tags),
                    device.status.as_str(),
                    device.last_checked.map(|t| t.to_rfc3339()),
                    device.created_at.to_rfc3339(),
                    device.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| map_insert_error(e, "ipAddress"))?;
            Ok(())
        })
    }

    pub fn update_device(&self, device: &Device) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE devices SET
                        name = ?2, ip_address = ?3, device_type = ?4, vendor = ?5,
                        username = ?6, password_encrypted = ?7, ssh_port = ?8,
                        snmp_community = ?9, tags = ?10, status = ?11,
                        last_checked = ?12, updated_at = ?13
                    WHERE id = ?1",
                    params![
                        device.id,
                        device.name,
                        device.ip_address,
                        device.device_type,
                        device.vendor,
                        device.username,
                        device.password_encrypted,
                        device.ssh_port,
                        device.snmp_community,
                        encode_tags(&device.tags),
                        device.status.as_str(),
                        device.last_checked.map(|t| t.to_rfc3339()),
                        device.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| map_insert_error(e, "ipAddress"))?;
            Ok(changed > 0)
        })
    }

    pub fn delete_device(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, ip_address, device_type, vendor, username,
                        password_encrypted, ssh_port, snmp_community, tags,
                        status, last_checked, created_at, updated_at
                 FROM devices WHERE id = ?1",
                params![id],
                row_to_device,
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
        })
    }

    pub fn get_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, ip_address, device_type, vendor, username,
                        password_encrypted, ssh_port, snmp_community, tags,
                        status, last_checked, created_at, updated_at
                 FROM devices WHERE ip_address = ?1",
                params![ip],
                row_to_device,
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
        })
    }

    pub fn get_all_devices(&self) -> Result<Vec<Device>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, ip_address, device_type, vendor, username,
                        password_encrypted, ssh_port, snmp_community, tags,
                        status, last_checked, created_at, updated_at
                 FROM devices ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_device)
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::Database(e.to_string()))?);
            }
            Ok(out)
        })
    }

    // --- security rules ------------------------------------------------

    pub fn insert_rule(&self, rule: &SecurityRule) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO security_rules (
                    id, name, description, vendor, command, expected_pattern,
                    severity, enabled, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rule.id,
                    rule.name,
                    rule.description,
                    rule.vendor,
                    rule.command,
                    rule.expected_pattern,
                    rule.severity.as_str(),
                    rule.enabled,
                    rule.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| map_insert_error(e, "name"))?;
            Ok(())
        })
    }

    pub fn rule_exists(&self, name: &str, vendor: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM security_rules WHERE name = ?1 AND vendor = ?2",
                params![name, vendor],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn update_rule(&self, rule: &SecurityRule) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE security_rules SET
                    name = ?2, description = ?3, vendor = ?4, command = ?5,
                    expected_pattern = ?6, severity = ?7, enabled = ?8
                 WHERE id = ?1",
                params![
                    rule.id,
                    rule.name,
                    rule.description,
                    rule.vendor,
                    rule.command,
                    rule.expected_pattern,
                    rule.severity.as_str(),
                    rule.enabled,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE security_rules SET enabled = ?2 WHERE id = ?1",
                params![id, enabled],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM security_rules WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }

    pub fn get_all_rules(&self) -> Result<Vec<SecurityRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, vendor, command, expected_pattern,
                        severity, enabled, created_at
                 FROM security_rules ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], row_to_rule)
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::Database(e.to_string()))?);
            }
            Ok(out)
        })
    }

    pub fn get_rules_by_vendor(&self, vendor: &str) -> Result<Vec<SecurityRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, vendor, command, expected_pattern,
                        severity, enabled, created_at
                 FROM security_rules WHERE vendor = ?1 OR vendor = 'generic'
                 ORDER BY name",
            )?;
            let rows = stmt
                .query_map(params![vendor], row_to_rule)
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::Database(e.to_string()))?);
            }
            Ok(out)
        })
    }

    // --- check results -------------------------------------------------

    pub fn insert_check_result(&self, result: &CheckResult) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO check_results (
                    id, device_id, check_name, check_type, severity, status,
                    message, evidence, checked_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.id,
                    result.device_id,
                    result.check_name,
                    result.check_type,
                    result.severity.as_str(),
                    result.status.as_str(),
                    result.message,
                    result.evidence,
                    result.checked_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_check_results_for_device(&self, device_id: &str) -> Result<Vec<CheckResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, check_name, check_type, severity, status,
                        message, evidence, checked_at
                 FROM check_results WHERE device_id = ?1 ORDER BY checked_at",
            )?;
            let rows = stmt
                .query_map(params![device_id], row_to_check_result)
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::Database(e.to_string()))?);
            }
            Ok(out)
        })
    }

    // --- app settings ----------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let journal_mode = match config.journal_mode {
        JournalMode::Wal => "WAL",
        JournalMode::Delete => "DELETE",
    };
    conn.pragma_update(None, "journal_mode", journal_mode)?;
    conn.busy_timeout(Duration::from_secs(config.busy_timeout_secs))?;
    conn.pragma_update(None, "cache_size", -config.cache_size_kib)?;
    if config.temp_store_memory {
        conn.pragma_update(None, "temp_store", "MEMORY")?;
    }
    Ok(())
}

/// Maps a constraint violation to `Error::Duplicate` naming `field`,
/// the column (or leading column of a composite unique index) the
/// caller's INSERT/UPDATE is actually guarded by — `insert_device`
/// passes `"ipAddress"`, `insert_rule` passes `"name"` for the
/// `(name, vendor)` unique index on `security_rules` — so a rule-name
/// collision is never reported as a duplicate IP address.
fn map_insert_error(e: rusqlite::Error, field: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(ref ffi_err, _) = e {
        if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Duplicate {
                field: field.to_string(),
            };
        }
    }
    Error::Database(e.to_string())
}

fn encode_tags(tags: &[String]) -> String {
    tags.join(",")
}

fn decode_tags(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(',').map(|s| s.to_string()).collect()
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    let tags_raw: String = row.get(9)?;
    let last_checked: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let status: String = row.get(10)?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        ip_address: row.get(2)?,
        device_type: row.get(3)?,
        vendor: row.get(4)?,
        username: row.get(5)?,
        password_encrypted: row.get(6)?,
        ssh_port: row.get(7)?,
        snmp_community: row.get(8)?,
        tags: decode_tags(&tags_raw),
        status: DeviceStatus::parse(&status),
        last_checked: last_checked.as_deref().map(parse_timestamp),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<SecurityRule> {
    let severity: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(SecurityRule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        vendor: row.get(3)?,
        command: row.get(4)?,
        expected_pattern: row.get(5)?,
        severity: Severity::parse(&severity),
        enabled: row.get(7)?,
        created_at: parse_timestamp(&created_at),
    })
}

fn row_to_check_result(row: &rusqlite::Row) -> rusqlite::Result<CheckResult> {
    let severity: String = row.get(4)?;
    let status: String = row.get(5)?;
    let checked_at: String = row.get(8)?;
    Ok(CheckResult {
        id: row.get(0)?,
        device_id: row.get(1)?,
        check_name: row.get(2)?,
        check_type: row.get(3)?,
        severity: Severity::parse(&severity),
        status: match status.as_str() {
            "PASS" => CheckStatus::Pass,
            "FAIL" => CheckStatus::Fail,
            "WARNING" => CheckStatus::Warning,
            _ => CheckStatus::Error,
        },
        message: row.get(6)?,
        evidence: row.get(7)?,
        checked_at: parse_timestamp(&checked_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(ip: &str) -> Device {
        let now = Utc::now();
        Device {
            id: uuid::Uuid::new_v4().to_string(),
            name: "Core-01".into(),
            ip_address: ip.into(),
            device_type: "router".into(),
            vendor: "cisco".into(),
            username: "admin".into(),
            password_encrypted: vec![1, 2, 3],
            ssh_port: 22,
            snmp_community: None,
            tags: vec!["core".into(), "edge".into()],
            status: DeviceStatus::Unknown,
            last_checked: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_and_fetch_by_ip() {
        let store = Store::open_in_memory().unwrap();
        let device = sample_device("10.0.0.1");
        store.insert_device(&device).unwrap();
        let fetched = store.get_device_by_ip("10.0.0.1").unwrap().unwrap();
        assert_eq!(fetched.name, "Core-01");
        assert_eq!(fetched.tags, vec!["core", "edge"]);
    }

    #[test]
    fn duplicate_ip_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_device(&sample_device("10.0.0.1")).unwrap();
        let err = store.insert_device(&sample_device("10.0.0.1")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Duplicate);
        match err {
            Error::Duplicate { field } => assert_eq!(field, "ipAddress"),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_rule_name_and_vendor_is_reported_as_name_not_ip() {
        let store = Store::open_in_memory().unwrap();
        let rule = SecurityRule {
            id: uuid::Uuid::new_v4().to_string(),
            name: "ssh-enabled".into(),
            description: "d".into(),
            vendor: "cisco".into(),
            command: "show ip ssh".into(),
            expected_pattern: String::new(),
            severity: Severity::High,
            enabled: true,
            created_at: Utc::now(),
        };
        store.insert_rule(&rule).unwrap();
        let mut collision = rule.clone();
        collision.id = uuid::Uuid::new_v4().to_string();
        let err = store.insert_rule(&collision).unwrap_err();
        match err {
            Error::Duplicate { field } => assert_eq!(field, "name"),
            other => panic!("expected Duplicate{{field: \"name\"}}, got {other:?}"),
        }
    }

    #[test]
    fn deleting_device_cascades_check_results() {
        let store = Store::open_in_memory().unwrap();
        let device = sample_device("10.0.0.1");
        store.insert_device(&device).unwrap();
        store
            .insert_check_result(&CheckResult {
                id: uuid::Uuid::new_v4().to_string(),
                device_id: device.id.clone(),
                check_name: "ssh-enabled".into(),
                check_type: "regex".into(),
                severity: Severity::High,
                status: CheckStatus::Pass,
                message: "ok".into(),
                evidence: "SSH Enabled".into(),
                checked_at: Utc::now(),
            })
            .unwrap();
        store.delete_device(&device.id).unwrap();
        let remaining = store.get_check_results_for_device(&device.id).unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn health_check_succeeds() {
        let store = Store::open_in_memory().unwrap();
        store.health_check().await.unwrap();
    }
}
