//! SQL-backed abuse store.
//!
//! One embedded SQLite database, two tables: the reputation-score cache
//! keyed by IP text, and the pattern records keyed by hex MD5 of a
//! connection's opening bytes. The single connection lives behind a mutex
//! and every statement runs on the blocking pool. Schema changes are
//! additive only.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use sixgate_core::{SixgateError, SixgateResult};
use tokio::sync::Mutex;
use tokio::task;

/// Sentinel score marking an IP we have already reported; outside the
/// service's 0-100 range and sticky until the cache row expires.
pub const REPORTED_BY_US: i64 = 101;

/// A full pattern row.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    pub hash: String,
    pub category: String,
    pub comment: String,
    pub confirmed: bool,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_ip: String,
    pub last_port: i64,
    pub count: i64,
    pub expires_at: i64,
    pub data: Option<Vec<u8>>,
}

/// The subset of a confirmed pattern that goes into an abuse report.
#[derive(Debug, Clone)]
pub struct KnownPattern {
    pub hash: String,
    pub category: String,
    pub comment: String,
}

pub struct AbuseStore {
    conn: Arc<Mutex<Connection>>,
}

fn current_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

fn db_err(e: rusqlite::Error) -> SixgateError {
    SixgateError::Db(e.to_string())
}

fn join_err(e: task::JoinError) -> SixgateError {
    SixgateError::Db(format!("store task failed: {e}"))
}

impl AbuseStore {
    /// Open (or create) the database and ensure the schema exists.
    pub fn open(path: &Path) -> SixgateResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS abuseipdb_cache (
                ip TEXT PRIMARY KEY,
                confidence INTEGER,
                updated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS patterns (
                hash TEXT PRIMARY KEY,
                category TEXT,
                comment TEXT,
                confirmed INTEGER,
                first_seen INTEGER,
                last_seen INTEGER,
                last_ip TEXT,
                last_port INTEGER,
                count INTEGER,
                expires_at INTEGER,
                data BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_last_ip ON patterns(last_ip);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> SixgateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(join_err)?
        .map_err(db_err)
    }

    /// Cached score, only if refreshed within `max_age`.
    pub async fn fresh_score(&self, ip: &str, max_age: Duration) -> SixgateResult<Option<i64>> {
        let ip = ip.to_string();
        let cutoff = current_epoch() - max_age.as_secs() as i64;
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT confidence FROM abuseipdb_cache WHERE ip = ?1 AND updated_at >= ?2",
                params![ip, cutoff],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Cached score regardless of age. The report path uses this: the
    /// REPORTED_BY_US sentinel suppresses re-reports for as long as the
    /// row exists at all.
    pub async fn raw_score(&self, ip: &str) -> SixgateResult<Option<i64>> {
        let ip = ip.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT confidence FROM abuseipdb_cache WHERE ip = ?1",
                params![ip],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Upsert the cached score for an IP, stamping it now.
    pub async fn set_score(&self, ip: &str, score: i64) -> SixgateResult<()> {
        let ip = ip.to_string();
        let now = current_epoch();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO abuseipdb_cache (ip, confidence, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![ip, score, now],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn pattern_by_hash(&self, hash: &str) -> SixgateResult<Option<PatternRecord>> {
        let hash = hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT hash, category, comment, confirmed, first_seen, last_seen,
                        last_ip, last_port, count, expires_at, data
                 FROM patterns WHERE hash = ?1",
                params![hash],
                row_to_pattern,
            )
            .optional()
        })
        .await
    }

    /// How many unconfirmed patterns this IP is currently blamed for.
    pub async fn count_unconfirmed_by_ip(&self, ip: &str) -> SixgateResult<i64> {
        let ip = ip.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM patterns WHERE confirmed = 0 AND last_ip = ?1",
                params![ip],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Insert or update an unconfirmed pattern observation.
    ///
    /// A fresh row starts at count 1 with no captured bytes. On conflict
    /// the row's last-seen/IP/port and expiry refresh, the count
    /// increments, and the raw bytes are stored only when the updated
    /// count reaches `save_after` *and* the previous observation came
    /// from a different IP — recurrence across sources is what marks a
    /// shared exploit template.
    pub async fn upsert_unconfirmed(
        &self,
        hash: &str,
        ip: &str,
        port: u16,
        data: Vec<u8>,
        expire: Duration,
        save_after: i64,
    ) -> SixgateResult<()> {
        let hash = hash.to_string();
        let ip = ip.to_string();
        let now = current_epoch();
        let expires_at = now + expire.as_secs() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO patterns (
                    hash, category, comment, confirmed, first_seen, last_seen,
                    last_ip, last_port, count, expires_at
                 ) VALUES (?1, '', '', 0, ?2, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(hash) DO UPDATE SET
                    last_seen = excluded.last_seen,
                    last_ip = excluded.last_ip,
                    last_port = excluded.last_port,
                    count = patterns.count + 1,
                    expires_at = excluded.expires_at,
                    data = CASE
                        WHEN patterns.count + 1 >= ?6 AND patterns.last_ip <> excluded.last_ip
                            THEN ?7
                        ELSE NULL
                    END",
                params![hash, now, ip, port, expires_at, save_after, data],
            )
            .map(|_| ())
        })
        .await
    }

    /// Delete stale reputation rows and expired unconfirmed patterns.
    /// Confirmed patterns never expire.
    pub async fn sweep(&self, ip_expire: Duration) -> SixgateResult<()> {
        let now = current_epoch();
        let ip_cutoff = now - ip_expire.as_secs() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM abuseipdb_cache WHERE updated_at < ?1",
                params![ip_cutoff],
            )?;
            conn.execute(
                "DELETE FROM patterns WHERE confirmed = 0 AND expires_at < ?1",
                params![now],
            )?;
            Ok(())
        })
        .await
    }

    // ── Operator interface (consumed by the external pattern UI) ────────

    /// Flip a pattern's confirmed flag and set its report metadata.
    pub async fn set_confirmed(
        &self,
        hash: &str,
        confirmed: bool,
        category: &str,
        comment: &str,
    ) -> SixgateResult<bool> {
        let hash = hash.to_string();
        let category = category.to_string();
        let comment = comment.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE patterns SET confirmed = ?2, category = ?3, comment = ?4 WHERE hash = ?1",
                params![hash, confirmed as i64, category, comment],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Most recently seen patterns, newest first.
    pub async fn list_patterns(&self, limit: i64) -> SixgateResult<Vec<PatternRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, category, comment, confirmed, first_seen, last_seen,
                        last_ip, last_port, count, expires_at, data
                 FROM patterns ORDER BY last_seen DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], row_to_pattern)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_pattern(&self, hash: &str) -> SixgateResult<bool> {
        let hash = hash.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM patterns WHERE hash = ?1", params![hash])?;
            Ok(changed > 0)
        })
        .await
    }
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> Result<PatternRecord, rusqlite::Error> {
    let confirmed: i64 = row.get(3)?;
    Ok(PatternRecord {
        hash: row.get(0)?,
        category: row.get(1)?,
        comment: row.get(2)?,
        confirmed: confirmed != 0,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        last_ip: row.get(6)?,
        last_port: row.get(7)?,
        count: row.get(8)?,
        expires_at: row.get(9)?,
        data: row.get(10)?,
    })
}
