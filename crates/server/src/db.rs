// Database persistence layer using SQLite.
//
// All timestamps are stored as ISO-8601 local civil time strings
// ("%Y-%m-%dT%H:%M:%S%.f"). That format compares correctly as text, so
// rolling-window queries are plain string comparisons against a cutoff.

use chrono::{Duration, Local};
use rusqlite::{params, Connection};
use secmon_core::FailedLoginEvent;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Longest failure-reason (NTSTATUS) string persisted. `0xC000006A`
/// fits comfortably; anything longer is garbage and gets truncated.
const MAX_FAILURE_REASON_LEN: usize = 20;

/// Current wall-clock as a storable timestamp string.
pub fn now_string() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Timestamp string `minutes` before now; the lower edge of a rolling
/// window.
pub fn minutes_ago_string(minutes: i64) -> String {
    (Local::now() - Duration::minutes(minutes))
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Timestamp string `minutes` after now; block expiry deadlines.
pub fn minutes_ahead_string(minutes: i64) -> String {
    (Local::now() + Duration::minutes(minutes))
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Best-effort parse for numeric event fields; `-`, empty, and garbage
/// become None rather than failing the event.
fn safe_int(value: Option<&str>) -> Option<i64> {
    let s = value?.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    s.parse().ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousIpRow {
    pub source_ip: String,
    pub failure_count: i64,
    pub first_seen: String,
    pub last_seen: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostRow {
    pub host_id: String,
    pub host_name: Option<String>,
    pub host_ip: Option<String>,
    pub collection_method: String,
    pub status: String,
    pub last_seen: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockRow {
    pub id: i64,
    pub source_ip: String,
    pub created_at: String,
    pub expires_at: String,
    pub reason: String,
    pub created_by: String,
    pub is_active: bool,
    pub cleared_at: Option<String>,
    pub cleared_by: Option<String>,
    pub scope: String,
    pub target_host_id: Option<String>,
    pub firewall_applied: bool,
}

/// Per-host threshold overrides; None fields inherit global settings.
#[derive(Debug, Clone, Default)]
pub struct HostPolicyRow {
    pub host_id: String,
    pub threshold: Option<i64>,
    pub window_minutes: Option<i64>,
    pub block_duration_minutes: Option<i64>,
    pub auto_block_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsernameCount {
    pub username: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceIpCount {
    pub source_ip: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostCount {
    pub host_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourCount {
    pub hour: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_failed_attempts: i64,
    pub unique_attackers: i64,
    pub blocked_ips: i64,
    pub attacks_last_24h: i64,
    pub attacks_last_hour: i64,
    pub top_attacked_usernames: Vec<UsernameCount>,
    pub attacks_by_hour: Vec<HourCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatistics {
    #[serde(flatten)]
    pub base: Statistics,
    pub active_hosts: i64,
    pub inactive_hosts: i64,
    pub attacks_by_host: Vec<HostCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostAttackSummary {
    pub host_id: String,
    pub total_attacks: i64,
    pub unique_attackers: i64,
    pub attacks_last_24h: i64,
    pub attacks_last_hour: i64,
    pub top_attacked_usernames: Vec<UsernameCount>,
    pub top_source_ips: Vec<SourceIpCount>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS failed_logins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_ip TEXT NOT NULL,
                username TEXT,
                source_host_name TEXT,
                logon_type INTEGER,
                failure_reason TEXT,
                source_port INTEGER,
                event_timestamp TEXT NOT NULL,
                host_id TEXT NOT NULL,
                event_class INTEGER NOT NULL DEFAULT 4625,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS suspicious_ips (
                source_ip TEXT PRIMARY KEY,
                failure_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosts (
                host_id TEXT PRIMARY KEY,
                host_name TEXT,
                host_ip TEXT,
                collection_method TEXT NOT NULL DEFAULT 'agent',
                status TEXT NOT NULL DEFAULT 'active',
                last_seen TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blocked_ips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_ip TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_by TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                cleared_at TEXT,
                cleared_by TEXT,
                scope TEXT NOT NULL DEFAULT 'global',
                target_host_id TEXT,
                firewall_applied INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS host_policies (
                host_id TEXT PRIMARY KEY,
                threshold INTEGER,
                window_minutes INTEGER,
                block_duration_minutes INTEGER,
                auto_block_enabled INTEGER
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_failed_logins_ip_ts
                ON failed_logins(source_ip, event_timestamp);

            CREATE INDEX IF NOT EXISTS idx_failed_logins_host
                ON failed_logins(host_id);

            CREATE INDEX IF NOT EXISTS idx_failed_logins_ts
                ON failed_logins(event_timestamp);

            CREATE INDEX IF NOT EXISTS idx_blocked_ips_active
                ON blocked_ips(is_active);

            INSERT OR IGNORE INTO settings (key, value) VALUES
                ('THRESHOLD', '5'),
                ('TIME_WINDOW', '5'),
                ('BLOCK_DURATION', '120'),
                ('ENABLE_AUTO_BLOCK', 'true'),
                ('GLOBAL_THRESHOLD', ''),
                ('ENABLE_GLOBAL_AUTO_BLOCK', 'true');
        "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Idempotently persist one event. Returns the post-insert lifetime
    /// failure count for the IP when the event was admitted, or None
    /// when the natural key already exists.
    ///
    /// Insert, suspicious-IP upsert, and host touch happen in one
    /// transaction so a crash can never leave them disagreeing.
    pub fn ingest_event(
        &self,
        host_id: &str,
        host_name: &str,
        ev: &FailedLoginEvent,
    ) -> Result<Option<i64>, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let username = ev.username.as_deref();
        let source_port = safe_int(ev.source_port.as_deref());

        // Natural-key probe; IS compares NULLs as equal.
        let exists: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM failed_logins
                WHERE source_ip = ?1 AND username IS ?2 AND source_port IS ?3
                  AND event_timestamp = ?4 AND host_id = ?5
            )",
            params![ev.ip_address, username, source_port, ev.timestamp, host_id],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(None);
        }

        let now = now_string();
        let failure_reason: Option<String> = ev
            .status
            .as_deref()
            .map(|s| s.chars().take(MAX_FAILURE_REASON_LEN).collect());

        tx.execute(
            "INSERT INTO failed_logins
                (source_ip, username, source_host_name, logon_type, failure_reason,
                 source_port, event_timestamp, host_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ev.ip_address,
                username,
                ev.workstation.as_deref(),
                safe_int(ev.logon_type.as_deref()),
                failure_reason,
                source_port,
                ev.timestamp,
                host_id,
                now,
            ],
        )?;

        tx.execute(
            "INSERT INTO suspicious_ips
                (source_ip, failure_count, first_seen, last_seen, status, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2, 'active', ?3, ?3)
             ON CONFLICT(source_ip) DO UPDATE SET
                failure_count = failure_count + 1,
                last_seen = excluded.last_seen,
                updated_at = excluded.updated_at",
            params![ev.ip_address, ev.timestamp, now],
        )?;

        let attempt_number: i64 = tx.query_row(
            "SELECT failure_count FROM suspicious_ips WHERE source_ip = ?1",
            params![ev.ip_address],
            |row| row.get(0),
        )?;

        // An event from a host is proof of life: upsert and reactivate.
        tx.execute(
            "INSERT INTO hosts (host_id, host_name, collection_method, status, last_seen, created_at)
             VALUES (?1, ?2, 'agent', 'active', ?3, ?3)
             ON CONFLICT(host_id) DO UPDATE SET
                host_name = excluded.host_name,
                status = 'active',
                last_seen = excluded.last_seen",
            params![host_id, host_name, now],
        )?;

        tx.commit()?;
        Ok(Some(attempt_number))
    }

    // ------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------

    pub fn register_host(
        &self,
        host_id: &str,
        host_name: &str,
        host_ip: &str,
        collection_method: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO hosts (host_id, host_name, host_ip, collection_method, status, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
             ON CONFLICT(host_id) DO UPDATE SET
                host_name = excluded.host_name,
                host_ip = excluded.host_ip,
                collection_method = excluded.collection_method,
                status = 'active',
                last_seen = excluded.last_seen",
            params![host_id, host_name, host_ip, collection_method, now_string()],
        )?;
        Ok(())
    }

    pub fn list_hosts(&self) -> Result<Vec<HostRow>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host_id, host_name, host_ip, collection_method, status, last_seen, created_at
             FROM hosts ORDER BY host_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HostRow {
                    host_id: row.get(0)?,
                    host_name: row.get(1)?,
                    host_ip: row.get(2)?,
                    collection_method: row.get(3)?,
                    status: row.get(4)?,
                    last_seen: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a host inactive. Returns false when the host is unknown.
    pub fn deactivate_host(&self, host_id: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE hosts SET status = 'inactive' WHERE host_id = ?1",
            params![host_id],
        )?;
        Ok(changed > 0)
    }

    pub fn count_hosts_with_status(&self, status: &str) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM hosts WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
    }

    // ------------------------------------------------------------------
    // Suspicious IPs
    // ------------------------------------------------------------------

    pub fn suspicious_ips(&self, threshold: i64) -> Result<Vec<SuspiciousIpRow>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_ip, failure_count, first_seen, last_seen, status
             FROM suspicious_ips
             WHERE failure_count >= ?1 AND status = 'active'
             ORDER BY failure_count DESC",
        )?;
        let rows = stmt
            .query_map(params![threshold], |row| {
                Ok(SuspiciousIpRow {
                    source_ip: row.get(0)?,
                    failure_count: row.get(1)?,
                    first_seen: row.get(2)?,
                    last_seen: row.get(3)?,
                    status: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_suspicious_status(&self, ip: &str, status: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE suspicious_ips SET status = ?2, updated_at = ?3 WHERE source_ip = ?1",
            params![ip, status, now_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rolling-window counts (threshold inputs — never the lifetime
    // counter; see suspicious_ips for why the two must not be mixed)
    // ------------------------------------------------------------------

    pub fn count_failed_since(&self, ip: &str, since: &str) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM failed_logins
             WHERE source_ip = ?1 AND event_timestamp >= ?2",
            params![ip, since],
            |row| row.get(0),
        )
    }

    pub fn count_failed_for_host_since(
        &self,
        ip: &str,
        host_id: &str,
        since: &str,
    ) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM failed_logins
             WHERE source_ip = ?1 AND host_id = ?2 AND event_timestamp >= ?3",
            params![ip, host_id, since],
            |row| row.get(0),
        )
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_block(
        &self,
        ip: &str,
        scope: &str,
        target_host_id: Option<&str>,
        reason: &str,
        expires_at: &str,
        created_by: &str,
    ) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO blocked_ips
                (source_ip, created_at, expires_at, reason, created_by, is_active, scope, target_host_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
            params![ip, now_string(), expires_at, reason, created_by, scope, target_host_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn has_active_block(
        &self,
        ip: &str,
        scope: &str,
        target_host_id: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM blocked_ips
                WHERE source_ip = ?1 AND scope = ?2 AND target_host_id IS ?3 AND is_active = 1
            )",
            params![ip, scope, target_host_id],
            |row| row.get(0),
        )
    }

    pub fn active_blocks(&self) -> Result<Vec<BlockRow>, rusqlite::Error> {
        self.select_blocks("WHERE is_active = 1", &[])
    }

    /// Active blocks whose expiry deadline has passed.
    pub fn expired_active_blocks(&self, now: &str) -> Result<Vec<BlockRow>, rusqlite::Error> {
        self.select_blocks(
            "WHERE is_active = 1 AND expires_at <= ?1",
            &[&now as &dyn rusqlite::ToSql],
        )
    }

    /// Active blocks the firewall has not confirmed yet (apply failed
    /// transiently; the reconciler retries these).
    pub fn unapplied_active_blocks(&self) -> Result<Vec<BlockRow>, rusqlite::Error> {
        self.select_blocks("WHERE is_active = 1 AND firewall_applied = 0", &[])
    }

    fn select_blocks(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<BlockRow>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, source_ip, created_at, expires_at, reason, created_by, is_active,
                    cleared_at, cleared_by, scope, target_host_id, firewall_applied
             FROM blocked_ips {} ORDER BY created_at DESC",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(BlockRow {
                    id: row.get(0)?,
                    source_ip: row.get(1)?,
                    created_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    reason: row.get(4)?,
                    created_by: row.get(5)?,
                    is_active: row.get::<_, i64>(6)? != 0,
                    cleared_at: row.get(7)?,
                    cleared_by: row.get(8)?,
                    scope: row.get(9)?,
                    target_host_id: row.get(10)?,
                    firewall_applied: row.get::<_, i64>(11)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deactivate every active block for an IP; returns the rows that
    /// were cleared so the caller can tear down firewall rules.
    pub fn clear_active_blocks(
        &self,
        ip: &str,
        cleared_by: &str,
    ) -> Result<Vec<BlockRow>, rusqlite::Error> {
        let cleared = self.select_blocks(
            "WHERE source_ip = ?1 AND is_active = 1",
            &[&ip as &dyn rusqlite::ToSql],
        )?;
        if cleared.is_empty() {
            return Ok(cleared);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE blocked_ips
             SET is_active = 0, cleared_at = ?2, cleared_by = ?3
             WHERE source_ip = ?1 AND is_active = 1",
            params![ip, now_string(), cleared_by],
        )?;
        Ok(cleared)
    }

    pub fn expire_block(&self, id: i64) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE blocked_ips
             SET is_active = 0, cleared_at = ?2, cleared_by = 'expired'
             WHERE id = ?1",
            params![id, now_string()],
        )?;
        Ok(())
    }

    pub fn set_firewall_applied(&self, id: i64, applied: bool) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE blocked_ips SET firewall_applied = ?2 WHERE id = ?1",
            params![id, applied as i64],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-host policies
    // ------------------------------------------------------------------

    pub fn host_policy(&self, host_id: &str) -> Result<Option<HostPolicyRow>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host_id, threshold, window_minutes, block_duration_minutes, auto_block_enabled
             FROM host_policies WHERE host_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![host_id], |row| {
            Ok(HostPolicyRow {
                host_id: row.get(0)?,
                threshold: row.get(1)?,
                window_minutes: row.get(2)?,
                block_duration_minutes: row.get(3)?,
                auto_block_enabled: row.get::<_, Option<i64>>(4)?.map(|v| v != 0),
            })
        })?;
        rows.next().transpose()
    }

    pub fn set_host_policy(&self, policy: &HostPolicyRow) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO host_policies
                (host_id, threshold, window_minutes, block_duration_minutes, auto_block_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(host_id) DO UPDATE SET
                threshold = excluded.threshold,
                window_minutes = excluded.window_minutes,
                block_duration_minutes = excluded.block_duration_minutes,
                auto_block_enabled = excluded.auto_block_enabled",
            params![
                policy.host_id,
                policy.threshold,
                policy.window_minutes,
                policy.block_duration_minutes,
                policy.auto_block_enabled.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get(0))?;
        rows.next().transpose()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> Result<Statistics, rusqlite::Error> {
        let day_ago = minutes_ago_string(24 * 60);
        let hour_ago = minutes_ago_string(60);
        let conn = self.conn.lock().unwrap();

        let total_failed_attempts: i64 =
            conn.query_row("SELECT COUNT(*) FROM failed_logins", [], |r| r.get(0))?;
        let unique_attackers: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_ip) FROM failed_logins",
            [],
            |r| r.get(0),
        )?;
        let blocked_ips: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocked_ips WHERE is_active = 1",
            [],
            |r| r.get(0),
        )?;
        let attacks_last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_logins WHERE event_timestamp >= ?1",
            params![day_ago],
            |r| r.get(0),
        )?;
        let attacks_last_hour: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_logins WHERE event_timestamp >= ?1",
            params![hour_ago],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT username, COUNT(*) AS count FROM failed_logins
             WHERE username IS NOT NULL
             GROUP BY username ORDER BY count DESC LIMIT 10",
        )?;
        let top_attacked_usernames = stmt
            .query_map([], |row| {
                Ok(UsernameCount {
                    username: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Hour lives at a fixed offset in "YYYY-MM-DDTHH:MM:SS…".
        let mut stmt = conn.prepare(
            "SELECT substr(event_timestamp, 12, 2) AS hr, COUNT(*) AS count
             FROM failed_logins
             WHERE event_timestamp >= ?1
             GROUP BY hr ORDER BY hr",
        )?;
        let attacks_by_hour = stmt
            .query_map(params![day_ago], |row| {
                let hr: String = row.get(0)?;
                Ok(HourCount {
                    hour: format!("{}:00", hr),
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Statistics {
            total_failed_attempts,
            unique_attackers,
            blocked_ips,
            attacks_last_24h,
            attacks_last_hour,
            top_attacked_usernames,
            attacks_by_hour,
        })
    }

    pub fn global_statistics(&self) -> Result<GlobalStatistics, rusqlite::Error> {
        let base = self.statistics()?;
        let active_hosts = self.count_hosts_with_status("active")?;
        let inactive_hosts = self.count_hosts_with_status("inactive")?;

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host_id, COUNT(*) AS count FROM failed_logins
             GROUP BY host_id ORDER BY count DESC",
        )?;
        let attacks_by_host = stmt
            .query_map([], |row| {
                Ok(HostCount {
                    host_id: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GlobalStatistics {
            base,
            active_hosts,
            inactive_hosts,
            attacks_by_host,
        })
    }

    pub fn host_attacks(&self, host_id: &str) -> Result<HostAttackSummary, rusqlite::Error> {
        let day_ago = minutes_ago_string(24 * 60);
        let hour_ago = minutes_ago_string(60);
        let conn = self.conn.lock().unwrap();

        let total_attacks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_logins WHERE host_id = ?1",
            params![host_id],
            |r| r.get(0),
        )?;
        let unique_attackers: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_ip) FROM failed_logins WHERE host_id = ?1",
            params![host_id],
            |r| r.get(0),
        )?;
        let attacks_last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_logins WHERE host_id = ?1 AND event_timestamp >= ?2",
            params![host_id, day_ago],
            |r| r.get(0),
        )?;
        let attacks_last_hour: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_logins WHERE host_id = ?1 AND event_timestamp >= ?2",
            params![host_id, hour_ago],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT username, COUNT(*) AS count FROM failed_logins
             WHERE host_id = ?1 AND username IS NOT NULL
             GROUP BY username ORDER BY count DESC LIMIT 10",
        )?;
        let top_attacked_usernames = stmt
            .query_map(params![host_id], |row| {
                Ok(UsernameCount {
                    username: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT source_ip, COUNT(*) AS count FROM failed_logins
             WHERE host_id = ?1
             GROUP BY source_ip ORDER BY count DESC LIMIT 10",
        )?;
        let top_source_ips = stmt
            .query_map(params![host_id], |row| {
                Ok(SourceIpCount {
                    source_ip: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HostAttackSummary {
            host_id: host_id.to_string(),
            total_attacks,
            unique_attackers,
            attacks_last_24h,
            attacks_last_hour,
            top_attacked_usernames,
            top_source_ips,
        })
    }

    /// Cheap connectivity probe for the health endpoint.
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str, ip: &str, user: Option<&str>, port: Option<&str>) -> FailedLoginEvent {
        FailedLoginEvent {
            timestamp: ts.to_string(),
            ip_address: ip.to_string(),
            username: user.map(String::from),
            domain: None,
            logon_type: Some("3".to_string()),
            status: Some("0xC000006A".to_string()),
            workstation: Some("ATTACKER-PC".to_string()),
            source_port: port.map(String::from),
        }
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let ev = event("2026-02-21T10:00:00.0000000", "203.0.113.10", Some("admin"), Some("445"));

        assert_eq!(db.ingest_event("h-1", "WIN-1", &ev).unwrap(), Some(1));
        // Same natural key: silently dropped.
        assert_eq!(db.ingest_event("h-1", "WIN-1", &ev).unwrap(), None);

        let stats = db.statistics().unwrap();
        assert_eq!(stats.total_failed_attempts, 1);
    }

    #[test]
    fn test_same_event_different_host_is_distinct() {
        let db = Database::open_in_memory().unwrap();
        let ev = event("2026-02-21T10:00:00.0", "203.0.113.10", Some("admin"), Some("445"));

        assert!(db.ingest_event("h-1", "WIN-1", &ev).unwrap().is_some());
        assert!(db.ingest_event("h-2", "WIN-2", &ev).unwrap().is_some());
        assert_eq!(db.statistics().unwrap().total_failed_attempts, 2);
    }

    #[test]
    fn test_null_username_dedup() {
        let db = Database::open_in_memory().unwrap();
        let ev = event("2026-02-21T10:00:00.0", "203.0.113.10", None, None);

        assert!(db.ingest_event("h-1", "WIN-1", &ev).unwrap().is_some());
        assert!(db.ingest_event("h-1", "WIN-1", &ev).unwrap().is_none());
    }

    #[test]
    fn test_lifetime_counter_monotonic() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..4 {
            let ev = event(
                &format!("2026-02-21T10:00:0{}.0", i),
                "203.0.113.10",
                Some("admin"),
                Some("445"),
            );
            let attempt = db.ingest_event("h-1", "WIN-1", &ev).unwrap().unwrap();
            assert_eq!(attempt, i + 1);
        }
    }

    #[test]
    fn test_failure_reason_truncated() {
        let db = Database::open_in_memory().unwrap();
        let mut ev = event("2026-02-21T10:00:00.0", "203.0.113.10", Some("a"), None);
        ev.status = Some("X".repeat(64));
        db.ingest_event("h-1", "WIN-1", &ev).unwrap();

        let conn = db.conn.lock().unwrap();
        let reason: String = conn
            .query_row("SELECT failure_reason FROM failed_logins", [], |r| r.get(0))
            .unwrap();
        assert_eq!(reason.len(), 20);
    }

    #[test]
    fn test_attacking_workstation_recorded() {
        // The event's WorkstationName is the attacker's machine, kept
        // apart from hosts.host_name (the collecting host).
        let db = Database::open_in_memory().unwrap();
        let ev = event("2026-02-21T10:00:00.0", "203.0.113.10", Some("admin"), None);
        db.ingest_event("h-1", "WIN-EDGE01", &ev).unwrap();

        let conn = db.conn.lock().unwrap();
        let workstation: String = conn
            .query_row("SELECT source_host_name FROM failed_logins", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(workstation, "ATTACKER-PC");
    }

    #[test]
    fn test_ingest_upserts_host() {
        let db = Database::open_in_memory().unwrap();
        let ev = event("2026-02-21T10:00:00.0", "203.0.113.10", Some("a"), None);
        db.ingest_event("h-1", "WIN-1", &ev).unwrap();

        let hosts = db.list_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host_id, "h-1");
        assert_eq!(hosts[0].status, "active");
        assert_eq!(hosts[0].collection_method, "agent");
    }

    #[test]
    fn test_deactivate_unknown_host() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.deactivate_host("nope").unwrap());
    }

    #[test]
    fn test_windowed_count_excludes_old_events() {
        let db = Database::open_in_memory().unwrap();
        let recent = now_string();
        db.ingest_event(
            "h-1",
            "WIN-1",
            &event(&recent, "203.0.113.10", Some("a"), Some("1")),
        )
        .unwrap();
        db.ingest_event(
            "h-1",
            "WIN-1",
            &event("2020-01-01T00:00:00.0", "203.0.113.10", Some("a"), Some("2")),
        )
        .unwrap();

        let since = minutes_ago_string(5);
        assert_eq!(db.count_failed_since("203.0.113.10", &since).unwrap(), 1);
        // Lifetime counter keeps counting regardless of the window.
        let rows = db.suspicious_ips(1).unwrap();
        assert_eq!(rows[0].failure_count, 2);
    }

    #[test]
    fn test_block_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let expires = minutes_ahead_string(60);
        let id = db
            .insert_block("203.0.113.12", "global", None, "manual", &expires, "manual")
            .unwrap();

        assert!(db.has_active_block("203.0.113.12", "global", None).unwrap());
        db.set_firewall_applied(id, true).unwrap();

        let cleared = db.clear_active_blocks("203.0.113.12", "manual").unwrap();
        assert_eq!(cleared.len(), 1);
        assert!(!db.has_active_block("203.0.113.12", "global", None).unwrap());

        // Second clear finds nothing.
        assert!(db.clear_active_blocks("203.0.113.12", "manual").unwrap().is_empty());
    }

    #[test]
    fn test_expired_active_blocks() {
        let db = Database::open_in_memory().unwrap();
        let past = minutes_ago_string(5);
        let future = minutes_ahead_string(60);
        db.insert_block("203.0.113.1", "global", None, "r", &past, "auto")
            .unwrap();
        db.insert_block("203.0.113.2", "global", None, "r", &future, "auto")
            .unwrap();

        let expired = db.expired_active_blocks(&now_string()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].source_ip, "203.0.113.1");
    }

    #[test]
    fn test_settings_seeded_and_overridable() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_setting("THRESHOLD").unwrap().as_deref(), Some("5"));
        db.set_setting("THRESHOLD", "9").unwrap();
        assert_eq!(db.get_setting("THRESHOLD").unwrap().as_deref(), Some("9"));
        assert!(db.get_setting("NO_SUCH_KEY").unwrap().is_none());
    }

    #[test]
    fn test_safe_int() {
        assert_eq!(safe_int(Some("445")), Some(445));
        assert_eq!(safe_int(Some(" 7 ")), Some(7));
        assert_eq!(safe_int(Some("-")), None);
        assert_eq!(safe_int(Some("")), None);
        assert_eq!(safe_int(Some("abc")), None);
        assert_eq!(safe_int(None), None);
    }

    #[test]
    fn test_batch_order_preserved() {
        let db = Database::open_in_memory().unwrap();
        for (i, user) in ["first", "second", "third"].iter().enumerate() {
            let ev = event(
                &format!("2026-02-21T10:00:0{}.0", i),
                "203.0.113.10",
                Some(user),
                Some("445"),
            );
            db.ingest_event("h-1", "WIN-1", &ev).unwrap();
        }

        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT username FROM failed_logins ORDER BY id")
            .unwrap();
        let users: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(users, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_host_attacks_empty_projection() {
        let db = Database::open_in_memory().unwrap();
        let summary = db.host_attacks("ghost").unwrap();
        assert_eq!(summary.total_attacks, 0);
        assert_eq!(summary.unique_attackers, 0);
        assert!(summary.top_attacked_usernames.is_empty());
    }
}
