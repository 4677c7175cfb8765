//! Platform system of record, backed by `SQLite`.
//!
//! Holds the relational side of the traceability platform: organizations,
//! batches, units, consumers, and the audit records produced by the
//! verification pipeline (scan history, prediction scores, agent messages).
//!
//! # Schema
//!
//! `scan_history` is append-only: exactly one row per verification attempt,
//! inserted after the authenticity verdict and before notification fan-out
//! and risk scoring, so its generated id can be embedded in outbound
//! payloads and in the `prediction_scores` foreign key. Risk-ratio queries
//! range over `(region, scanned_at)`, which is indexed.
//!
//! All timestamps are RFC3339 UTC strings with millisecond precision, so
//! lexicographic range comparisons in SQL are chronologically correct.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use eyre::{eyre, Result, WrapErr};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Outcome of a verification attempt, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanResult {
    Genuine,
    Suspicious,
}

impl ScanResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Genuine => "GENUINE",
            Self::Suspicious => "SUSPICIOUS",
        }
    }
}

/// One serialized medication item.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    pub id: i64,
    pub serial_number: String,
    pub qr_signature: String,
    pub registry_sequence: u64,
    pub status: String,
}

/// A manufacturing lot.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub id: i64,
    pub batch_id: String,
    pub drug_name: String,
    pub registry_topic_id: String,
}

/// The legal entity owning a batch, with its notification channels.
#[derive(Debug, Clone, Serialize)]
pub struct OrganizationRecord {
    pub id: i64,
    pub name: String,
    pub region: String,
    pub managed_registry_topic: Option<String>,
    pub agent_inbound_topic: Option<String>,
    pub agent_outbound_topic: Option<String>,
}

/// An identified consumer profile.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: i64,
    pub user_id: String,
    pub region: Option<String>,
}

/// Unit joined with its batch and owning organization, as the verify
/// pipeline needs it.
#[derive(Debug, Clone)]
pub struct UnitBundle {
    pub unit: UnitRecord,
    pub batch: BatchRecord,
    pub organization: OrganizationRecord,
}

/// A scan-history row to insert.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub unit_id: i64,
    pub consumer_id: Option<i64>,
    pub is_anonymous: bool,
    pub region: String,
    pub scan_result: ScanResult,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub scanned_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS organizations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    region TEXT NOT NULL,
    managed_registry_topic TEXT,
    agent_inbound_topic TEXT,
    agent_outbound_topic TEXT
);
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL UNIQUE,
    drug_name TEXT NOT NULL,
    organization_id INTEGER NOT NULL REFERENCES organizations(id),
    registry_topic_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serial_number TEXT NOT NULL UNIQUE,
    batch_id INTEGER NOT NULL REFERENCES batches(id),
    qr_signature TEXT NOT NULL,
    registry_sequence INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE'
);
CREATE TABLE IF NOT EXISTS consumers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL UNIQUE,
    region TEXT
);
CREATE TABLE IF NOT EXISTS scan_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_id INTEGER NOT NULL REFERENCES units(id),
    consumer_id INTEGER REFERENCES consumers(id),
    is_anonymous INTEGER NOT NULL,
    region TEXT NOT NULL,
    scan_result TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    scanned_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS prediction_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL REFERENCES scan_history(id),
    label INTEGER NOT NULL,
    probability REAL NOT NULL,
    region TEXT NOT NULL,
    scan_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agent_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id INTEGER NOT NULL REFERENCES organizations(id),
    scan_id INTEGER NOT NULL REFERENCES scan_history(id),
    kind TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scan_history_region_time
    ON scan_history(region, scanned_at);
CREATE INDEX IF NOT EXISTS idx_scan_history_consumer
    ON scan_history(consumer_id);
";

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle to the platform database. Cheap to clone; the connection is
/// shared behind a mutex (writes are short and the scan path issues only
/// point queries and single-row inserts).
#[derive(Clone)]
pub struct ScanStore {
    conn: Arc<Mutex<Connection>>,
}

impl ScanStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).wrap_err("Failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| eyre!("store mutex poisoned"))
    }

    // -----------------------------------------------------------------
    // Registration (packaging-time and seeding)
    // -----------------------------------------------------------------

    pub fn register_organization(
        &self,
        name: &str,
        region: &str,
        managed_registry_topic: Option<&str>,
        agent_inbound_topic: Option<&str>,
        agent_outbound_topic: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO organizations
                (name, region, managed_registry_topic, agent_inbound_topic, agent_outbound_topic)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                region,
                managed_registry_topic,
                agent_inbound_topic,
                agent_outbound_topic
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn register_batch(
        &self,
        batch_id: &str,
        drug_name: &str,
        organization_id: i64,
        registry_topic_id: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO batches (batch_id, drug_name, organization_id, registry_topic_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![batch_id, drug_name, organization_id, registry_topic_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn register_unit(
        &self,
        serial_number: &str,
        batch_row_id: i64,
        qr_signature: &str,
        registry_sequence: u64,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO units (serial_number, batch_id, qr_signature, registry_sequence)
             VALUES (?1, ?2, ?3, ?4)",
            params![serial_number, batch_row_id, qr_signature, registry_sequence as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn register_consumer(&self, user_id: &str, region: Option<&str>) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO consumers (user_id, region) VALUES (?1, ?2)",
            params![user_id, region],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // -----------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------

    /// Unit joined with its batch and owning organization.
    pub fn unit_by_serial(&self, serial_number: &str) -> Result<Option<UnitBundle>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT u.id, u.serial_number, u.qr_signature, u.registry_sequence, u.status,
                    b.id, b.batch_id, b.drug_name, b.registry_topic_id,
                    o.id, o.name, o.region, o.managed_registry_topic,
                    o.agent_inbound_topic, o.agent_outbound_topic
             FROM units u
             JOIN batches b ON b.id = u.batch_id
             JOIN organizations o ON o.id = b.organization_id
             WHERE u.serial_number = ?1",
            params![serial_number],
            |row| {
                Ok(UnitBundle {
                    unit: UnitRecord {
                        id: row.get(0)?,
                        serial_number: row.get(1)?,
                        qr_signature: row.get(2)?,
                        registry_sequence: row.get::<_, i64>(3)? as u64,
                        status: row.get(4)?,
                    },
                    batch: BatchRecord {
                        id: row.get(5)?,
                        batch_id: row.get(6)?,
                        drug_name: row.get(7)?,
                        registry_topic_id: row.get(8)?,
                    },
                    organization: OrganizationRecord {
                        id: row.get(9)?,
                        name: row.get(10)?,
                        region: row.get(11)?,
                        managed_registry_topic: row.get(12)?,
                        agent_inbound_topic: row.get(13)?,
                        agent_outbound_topic: row.get(14)?,
                    },
                })
            },
        )
        .optional()
        .wrap_err("unit lookup failed")
    }

    pub fn consumer_by_user_id(&self, user_id: &str) -> Result<Option<ConsumerRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, user_id, region FROM consumers WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(ConsumerRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    region: row.get(2)?,
                })
            },
        )
        .optional()
        .wrap_err("consumer lookup failed")
    }

    // -----------------------------------------------------------------
    // Scan recording
    // -----------------------------------------------------------------

    /// Insert exactly one scan-history row; returns its generated id, the
    /// join key for prediction records and notification payloads.
    pub fn insert_scan(&self, scan: &NewScan) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scan_history
                (unit_id, consumer_id, is_anonymous, region, scan_result,
                 latitude, longitude, scanned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                scan.unit_id,
                scan.consumer_id,
                scan.is_anonymous,
                scan.region,
                scan.scan_result.as_str(),
                scan.latitude,
                scan.longitude,
                rfc3339(scan.scanned_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Persist a classifier output for a recorded scan.
    pub fn insert_prediction(
        &self,
        scan_id: i64,
        label: i64,
        probability: f64,
        region: &str,
        scan_type: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prediction_scores (scan_id, label, probability, region, scan_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![scan_id, label, probability, region, scan_type, rfc3339(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Audit record for an outbound agent notification. Callers treat a
    /// failure here as non-critical.
    pub fn insert_agent_message(
        &self,
        organization_id: i64,
        scan_id: i64,
        kind: &str,
        sequence: u64,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_messages (organization_id, scan_id, kind, sequence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![organization_id, scan_id, kind, sequence as i64, rfc3339(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // -----------------------------------------------------------------
    // Historical ratios for the risk feature builder
    // -----------------------------------------------------------------

    fn ratio(&self, sql: &str, p: impl rusqlite::Params) -> Result<f64> {
        let conn = self.lock()?;
        let (suspicious, total): (i64, i64) =
            conn.query_row(sql, p, |row| Ok((row.get(0)?, row.get(1)?)))?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(suspicious as f64 / total as f64)
    }

    /// Suspicious-scan ratio for a region since `since` (0 with no scans).
    pub fn regional_incident_rate(&self, region: &str, since: DateTime<Utc>) -> Result<f64> {
        self.ratio(
            "SELECT COALESCE(SUM(scan_result = 'SUSPICIOUS'), 0), COUNT(*)
             FROM scan_history WHERE region = ?1 AND scanned_at >= ?2",
            params![region, rfc3339(since)],
        )
    }

    /// Suspicious ratio of **anonymous** scans in a region since `since`.
    pub fn anonymous_suspicious_ratio(&self, region: &str, since: DateTime<Utc>) -> Result<f64> {
        self.ratio(
            "SELECT COALESCE(SUM(scan_result = 'SUSPICIOUS'), 0), COUNT(*)
             FROM scan_history
             WHERE region = ?1 AND scanned_at >= ?2 AND is_anonymous = 1",
            params![region, rfc3339(since)],
        )
    }

    /// A consumer's lifetime suspicious-scan ratio.
    pub fn consumer_suspicious_ratio(&self, consumer_id: i64) -> Result<f64> {
        self.ratio(
            "SELECT COALESCE(SUM(scan_result = 'SUSPICIOUS'), 0), COUNT(*)
             FROM scan_history WHERE consumer_id = ?1",
            params![consumer_id],
        )
    }

    // -----------------------------------------------------------------
    // Introspection (health checks and tests)
    // -----------------------------------------------------------------

    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn scan_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM scan_history", [], |r| r.get(0))?)
    }

    pub fn prediction_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM prediction_scores", [], |r| r.get(0))?)
    }

    /// Latest scan row fields the tests assert on: (result, is_anonymous).
    pub fn last_scan(&self) -> Result<Option<(String, bool)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT scan_result, is_anonymous FROM scan_history ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded() -> (ScanStore, i64, i64) {
        let store = ScanStore::open_in_memory().unwrap();
        let org = store
            .register_organization("PharmaCo", "Lagos", Some("0.0.900"), None, None)
            .unwrap();
        let batch = store
            .register_batch("ABC-123", "Amoxicillin 500mg", org, "0.0.100")
            .unwrap();
        (store, org, batch)
    }

    fn scan(unit_id: i64, result: ScanResult, anonymous: bool, at: DateTime<Utc>) -> NewScan {
        NewScan {
            unit_id,
            consumer_id: None,
            is_anonymous: anonymous,
            region: "Lagos".into(),
            scan_result: result,
            latitude: None,
            longitude: None,
            scanned_at: at,
        }
    }

    #[test]
    fn unit_bundle_roundtrip() {
        let (store, _org, batch) = seeded();
        store
            .register_unit("SER-ABC-123-0007", batch, "sig", 7)
            .unwrap();

        let bundle = store.unit_by_serial("SER-ABC-123-0007").unwrap().unwrap();
        assert_eq!(bundle.unit.serial_number, "SER-ABC-123-0007");
        assert_eq!(bundle.unit.registry_sequence, 7);
        assert_eq!(bundle.batch.batch_id, "ABC-123");
        assert_eq!(bundle.batch.registry_topic_id, "0.0.100");
        assert_eq!(bundle.organization.region, "Lagos");
        assert_eq!(
            bundle.organization.managed_registry_topic.as_deref(),
            Some("0.0.900")
        );

        assert!(store.unit_by_serial("SER-XXX-000-0000").unwrap().is_none());
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let (store, _org, batch) = seeded();
        store.register_unit("SER-ABC-123-0001", batch, "a", 1).unwrap();
        assert!(store.register_unit("SER-ABC-123-0001", batch, "b", 2).is_err());
    }

    #[test]
    fn regional_incident_rate_over_window() {
        let (store, _org, batch) = seeded();
        let unit = store.register_unit("SER-ABC-123-0001", batch, "s", 1).unwrap();
        let now = Utc::now();

        // No scans yet: rate is 0, not an error.
        assert_eq!(store.regional_incident_rate("Lagos", now - Duration::days(30)).unwrap(), 0.0);

        store.insert_scan(&scan(unit, ScanResult::Genuine, true, now)).unwrap();
        store.insert_scan(&scan(unit, ScanResult::Suspicious, true, now)).unwrap();
        // Outside the window: must not count.
        store
            .insert_scan(&scan(unit, ScanResult::Suspicious, true, now - Duration::days(45)))
            .unwrap();

        let rate = store
            .regional_incident_rate("Lagos", now - Duration::days(30))
            .unwrap();
        assert!((rate - 0.5).abs() < 1e-9, "expected 1/2, got {rate}");

        // Other regions are unaffected.
        assert_eq!(
            store.regional_incident_rate("Kano", now - Duration::days(30)).unwrap(),
            0.0
        );
    }

    #[test]
    fn anonymous_ratio_excludes_identified_scans() {
        let (store, _org, batch) = seeded();
        let unit = store.register_unit("SER-ABC-123-0001", batch, "s", 1).unwrap();
        let consumer = store.register_consumer("user-1", Some("Lagos")).unwrap();
        let now = Utc::now();

        let mut identified = scan(unit, ScanResult::Suspicious, false, now);
        identified.consumer_id = Some(consumer);
        store.insert_scan(&identified).unwrap();
        store.insert_scan(&scan(unit, ScanResult::Genuine, true, now)).unwrap();

        let ratio = store
            .anonymous_suspicious_ratio("Lagos", now - Duration::days(30))
            .unwrap();
        assert_eq!(ratio, 0.0, "identified suspicious scan must not count");
    }

    #[test]
    fn consumer_lifetime_ratio() {
        let (store, _org, batch) = seeded();
        let unit = store.register_unit("SER-ABC-123-0001", batch, "s", 1).unwrap();
        let consumer = store.register_consumer("user-1", None).unwrap();
        let now = Utc::now();

        for (result, offset) in [
            (ScanResult::Suspicious, 400), // old scans still count: lifetime window
            (ScanResult::Genuine, 1),
            (ScanResult::Genuine, 0),
        ] {
            let mut s = scan(unit, result, false, now - Duration::days(offset));
            s.consumer_id = Some(consumer);
            store.insert_scan(&s).unwrap();
        }

        let ratio = store.consumer_suspicious_ratio(consumer).unwrap();
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9);

        // Unknown consumer has no scans: 0.
        assert_eq!(store.consumer_suspicious_ratio(9999).unwrap(), 0.0);
    }

    #[test]
    fn prediction_links_to_scan() {
        let (store, _org, batch) = seeded();
        let unit = store.register_unit("SER-ABC-123-0001", batch, "s", 1).unwrap();
        let scan_id = store
            .insert_scan(&scan(unit, ScanResult::Genuine, true, Utc::now()))
            .unwrap();

        store
            .insert_prediction(scan_id, 0, 0.91, "Lagos", "consumer_qr")
            .unwrap();
        assert_eq!(store.prediction_count().unwrap(), 1);
    }

    #[test]
    fn agent_message_audit_row() {
        let (store, org, batch) = seeded();
        let unit = store.register_unit("SER-ABC-123-0001", batch, "s", 1).unwrap();
        let scan_id = store
            .insert_scan(&scan(unit, ScanResult::Genuine, true, Utc::now()))
            .unwrap();
        let id = store
            .insert_agent_message(org, scan_id, "unit_verified_request", 42)
            .unwrap();
        assert!(id > 0);
    }
}
