//! SQLite implementation of the CacheStore trait

use super::{AsnSummaryRow, CacheError, CacheStore};
use crate::models::{AsnRecord, CacheRow, CacheSource, EventCounts, EventKind, ScoreWeights};
use rusqlite::{params, Connection, OptionalExtension};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

const ROW_COLUMNS: &str = "ip, first_seen, last_seen, fails, oks, bans, unbans, \
     last_kind, last_jail, source, ban_count_total, last_ban_ts, last_ban_jail";

/// SQLite-backed aggregation cache.
///
/// A single connection behind a mutex serializes writes; each upsert
/// is one statement, so a crash never leaves a half-applied row.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

/// Row image as it comes off the wire, before IP parsing.
struct RawRow {
    ip: String,
    first_seen: i64,
    last_seen: i64,
    fails: i64,
    oks: i64,
    bans: i64,
    unbans: i64,
    last_kind: String,
    last_jail: String,
    source: String,
    ban_count_total: i64,
    last_ban_ts: Option<i64>,
    last_ban_jail: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            ip: row.get(0)?,
            first_seen: row.get(1)?,
            last_seen: row.get(2)?,
            fails: row.get(3)?,
            oks: row.get(4)?,
            bans: row.get(5)?,
            unbans: row.get(6)?,
            last_kind: row.get(7)?,
            last_jail: row.get(8)?,
            source: row.get(9)?,
            ban_count_total: row.get(10)?,
            last_ban_ts: row.get(11)?,
            last_ban_jail: row.get(12)?,
        })
    }

    fn into_cache_row(self) -> Result<CacheRow, CacheError> {
        Ok(CacheRow {
            ip: SqliteCacheStore::parse_ip(&self.ip)?,
            counts: EventCounts {
                fail: self.fails as u64,
                ok: self.oks as u64,
                ban: self.bans as u64,
                unban: self.unbans as u64,
            },
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            last_kind: EventKind::from_label(&self.last_kind),
            last_jail: self.last_jail,
            source: CacheSource::from_str(&self.source).unwrap_or(CacheSource::Live),
            ban_count_total: self.ban_count_total as u64,
            last_ban_ts: self.last_ban_ts,
            last_ban_jail: self.last_ban_jail,
        })
    }
}

impl SqliteCacheStore {
    /// Open (or create) the cache at the given path and initialize
    /// the schema. An empty store is a valid starting state.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory cache (useful for testing)
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        // journal_mode reports the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(SqliteCacheStore {
            conn: Mutex::new(conn),
        })
    }

    fn parse_ip(ip_str: &str) -> Result<IpAddr, CacheError> {
        IpAddr::from_str(ip_str)
            .map_err(|_| CacheError::InvalidData(format!("Invalid IP address: {}", ip_str)))
    }

    fn collect_rows(
        stmt: &mut rusqlite::Statement<'_>,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CacheRow>, CacheError> {
        let raw = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_cache_row).collect()
    }
}

impl CacheStore for SqliteCacheStore {
    fn upsert_delta(
        &self,
        ip: &IpAddr,
        delta: &EventCounts,
        timestamp: i64,
        source: CacheSource,
        last_kind: Option<EventKind>,
        last_jail: &str,
    ) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ip_cache (ip, first_seen, last_seen, fails, oks, bans, unbans,
                                   last_kind, last_jail, source)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(ip) DO UPDATE SET
                 first_seen = MIN(ip_cache.first_seen, excluded.first_seen),
                 last_seen = MAX(ip_cache.last_seen, excluded.last_seen),
                 fails = ip_cache.fails + excluded.fails,
                 oks = ip_cache.oks + excluded.oks,
                 bans = ip_cache.bans + excluded.bans,
                 unbans = ip_cache.unbans + excluded.unbans,
                 last_kind = excluded.last_kind,
                 last_jail = excluded.last_jail",
            params![
                ip.to_string(),
                timestamp,
                delta.fail as i64,
                delta.ok as i64,
                delta.ban as i64,
                delta.unban as i64,
                last_kind.map(|k| k.label()).unwrap_or(""),
                last_jail,
                source.as_str(),
            ],
        )?;
        Ok(())
    }

    fn upsert_imported(
        &self,
        ip: &IpAddr,
        ban_count_delta: u64,
        first_ban_ts: i64,
        last_ban_ts: Option<i64>,
        last_ban_jail: &str,
    ) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ip_cache (ip, first_seen, last_seen, source,
                                   ban_count_total, last_ban_ts, last_ban_jail)
             VALUES (?1, ?2, ?3, 'imported', ?4, ?5, ?6)
             ON CONFLICT(ip) DO UPDATE SET
                 ban_count_total = ip_cache.ban_count_total + excluded.ban_count_total,
                 last_ban_ts = CASE
                     WHEN excluded.last_ban_ts IS NULL THEN ip_cache.last_ban_ts
                     WHEN ip_cache.last_ban_ts IS NULL
                          OR excluded.last_ban_ts > ip_cache.last_ban_ts
                          THEN excluded.last_ban_ts
                     ELSE ip_cache.last_ban_ts
                 END,
                 last_ban_jail = CASE
                     WHEN excluded.last_ban_ts IS NULL THEN ip_cache.last_ban_jail
                     WHEN ip_cache.last_ban_ts IS NULL
                          OR excluded.last_ban_ts > ip_cache.last_ban_ts
                          THEN excluded.last_ban_jail
                     ELSE ip_cache.last_ban_jail
                 END,
                 first_seen = MIN(ip_cache.first_seen, excluded.first_seen),
                 last_seen = MAX(ip_cache.last_seen, excluded.last_seen)",
            params![
                ip.to_string(),
                first_ban_ts,
                last_ban_ts.unwrap_or(first_ban_ts),
                ban_count_delta as i64,
                last_ban_ts,
                last_ban_jail,
            ],
        )?;
        Ok(())
    }

    fn get_row(&self, ip: &IpAddr) -> Result<Option<CacheRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_cache WHERE ip = ?1",
            ROW_COLUMNS
        ))?;
        let raw = stmt
            .query_row(params![ip.to_string()], RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_cache_row).transpose()
    }

    fn list_rows(&self, search: &str, limit: usize) -> Result<Vec<CacheRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%{}%", search);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_cache
             WHERE ?1 = '' OR ip LIKE ?2
             ORDER BY ban_count_total DESC, bans DESC, fails DESC, last_seen DESC
             LIMIT ?3",
            ROW_COLUMNS
        ))?;
        Self::collect_rows(&mut stmt, &[&search, &pattern, &(limit as i64)])
    }

    fn rows_seen_since(&self, since: i64) -> Result<Vec<CacheRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_cache WHERE last_seen >= ?1 ORDER BY last_seen DESC",
            ROW_COLUMNS
        ))?;
        Self::collect_rows(&mut stmt, &[&since])
    }

    fn top_rows_by_score(
        &self,
        weights: &ScoreWeights,
        n: usize,
    ) -> Result<Vec<CacheRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_cache
             ORDER BY (bans * ?1 + fails * ?2 + unbans * ?3 + oks * ?4) DESC, last_seen DESC
             LIMIT ?5",
            ROW_COLUMNS
        ))?;
        Self::collect_rows(
            &mut stmt,
            &[
                &(weights.ban as i64),
                &(weights.fail as i64),
                &(weights.unban as i64),
                &(weights.ok as i64),
                &(n as i64),
            ],
        )
    }

    fn recent_ips(&self, n: usize) -> Result<Vec<IpAddr>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT ip FROM ip_cache ORDER BY last_seen DESC LIMIT ?1")?;
        let ips = stmt
            .query_map(params![n as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ips.iter().map(|s| Self::parse_ip(s)).collect()
    }

    fn upsert_asn(&self, record: &AsnRecord) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO asn_cache (ip, asn, country, organization, fetched_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(ip) DO UPDATE SET
                 asn = excluded.asn,
                 country = excluded.country,
                 organization = excluded.organization,
                 fetched_at = excluded.fetched_at,
                 resolved = excluded.resolved
             WHERE excluded.fetched_at >= asn_cache.fetched_at",
            params![
                record.ip.to_string(),
                record.asn,
                record.country,
                record.organization,
                record.fetched_at,
                record.resolved,
            ],
        )?;
        Ok(())
    }

    fn get_asn(&self, ip: &IpAddr) -> Result<Option<AsnRecord>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ip, asn, country, organization, fetched_at, resolved
             FROM asn_cache WHERE ip = ?1",
        )?;
        let raw = stmt
            .query_row(params![ip.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })
            .optional()?;
        match raw {
            Some((ip_str, asn, country, organization, fetched_at, resolved)) => {
                Ok(Some(AsnRecord {
                    ip: Self::parse_ip(&ip_str)?,
                    asn,
                    country,
                    organization,
                    fetched_at,
                    resolved,
                }))
            }
            None => Ok(None),
        }
    }

    fn ips_needing_asn(
        &self,
        now: i64,
        ttl: i64,
        negative_ttl: i64,
        limit: usize,
        cursor: Option<&IpAddr>,
    ) -> Result<Vec<IpAddr>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let cursor_str = cursor.map(|ip| ip.to_string());
        let mut stmt = conn.prepare(
            "SELECT i.ip FROM ip_cache i
             LEFT JOIN asn_cache a ON a.ip = i.ip
             WHERE (a.ip IS NULL
                    OR (a.resolved = 1 AND a.fetched_at < ?1 - ?2)
                    OR (a.resolved = 0 AND a.fetched_at < ?1 - ?3))
               AND (?4 IS NULL OR i.ip > ?4)
             ORDER BY i.ip
             LIMIT ?5",
        )?;
        let ips = stmt
            .query_map(
                params![now, ttl, negative_ttl, cursor_str, limit as i64],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        ips.iter().map(|s| Self::parse_ip(s)).collect()
    }

    fn asn_summary(&self, search: &str, limit: usize) -> Result<Vec<AsnSummaryRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%{}%", search.to_lowercase());
        let mut stmt = conn.prepare(
            "SELECT a.asn,
                    MAX(a.organization) AS organization,
                    MAX(a.country) AS country,
                    COUNT(*) AS ip_count,
                    SUM(i.fails), SUM(i.oks), SUM(i.bans), SUM(i.unbans),
                    SUM(i.ban_count_total),
                    MAX(a.fetched_at)
             FROM asn_cache a
             JOIN ip_cache i ON i.ip = a.ip
             WHERE a.resolved = 1
               AND (?1 = '' OR lower(a.asn) LIKE ?2
                    OR lower(a.organization) LIKE ?2 OR lower(a.country) LIKE ?2)
             GROUP BY a.asn
             ORDER BY SUM(i.ban_count_total) DESC, SUM(i.bans) DESC,
                      SUM(i.fails) DESC, COUNT(*) DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![search, pattern, limit as i64], |row| {
                Ok(AsnSummaryRow {
                    asn: row.get(0)?,
                    organization: row.get(1)?,
                    country: row.get(2)?,
                    ip_count: row.get::<_, i64>(3)? as u64,
                    counts: EventCounts {
                        fail: row.get::<_, i64>(4)? as u64,
                        ok: row.get::<_, i64>(5)? as u64,
                        ban: row.get::<_, i64>(6)? as u64,
                        unban: row.get::<_, i64>(7)? as u64,
                    },
                    ban_total_sum: row.get::<_, i64>(8)? as u64,
                    last_fetched: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn ips_in_asn(&self, asn: &str, limit: usize) -> Result<Vec<CacheRow>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_cache
             WHERE ip IN (SELECT ip FROM asn_cache WHERE asn = ?1 AND resolved = 1)
             ORDER BY ban_count_total DESC, bans DESC, fails DESC, last_seen DESC
             LIMIT ?2",
            ROW_COLUMNS
        ))?;
        Self::collect_rows(&mut stmt, &[&asn, &(limit as i64)])
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM import_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO import_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteCacheStore {
        SqliteCacheStore::in_memory().expect("Failed to create in-memory store")
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn record(ip_str: &str, fetched_at: i64) -> AsnRecord {
        AsnRecord {
            ip: ip(ip_str),
            asn: "64500".to_string(),
            country: "US".to_string(),
            organization: "EXAMPLE-NET".to_string(),
            fetched_at,
            resolved: true,
        }
    }

    #[test]
    fn test_upsert_delta_creates_row() {
        let store = create_test_store();
        let addr = ip("203.0.113.9");
        store
            .upsert_delta(
                &addr,
                &EventCounts::one(EventKind::Ban),
                1000,
                CacheSource::Live,
                Some(EventKind::Ban),
                "sshd",
            )
            .unwrap();

        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.counts.ban, 1);
        assert_eq!(row.first_seen, 1000);
        assert_eq!(row.last_seen, 1000);
        assert_eq!(row.last_kind, Some(EventKind::Ban));
        assert_eq!(row.last_jail, "sshd");
        assert_eq!(row.source, CacheSource::Live);
    }

    #[test]
    fn test_upsert_delta_is_additive() {
        let store = create_test_store();
        let addr = ip("203.0.113.9");
        for ts in [1000, 2000, 3000] {
            store
                .upsert_delta(
                    &addr,
                    &EventCounts::one(EventKind::Fail),
                    ts,
                    CacheSource::Live,
                    Some(EventKind::Fail),
                    "sshd",
                )
                .unwrap();
        }
        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.counts.fail, 3);
        assert_eq!(row.first_seen, 1000);
        assert_eq!(row.last_seen, 3000);
    }

    #[test]
    fn test_upsert_delta_last_seen_is_max() {
        let store = create_test_store();
        let addr = ip("203.0.113.9");
        // Out-of-order timestamps must not move last_seen backwards
        // or first_seen forwards.
        store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Fail), 5000,
                CacheSource::Live, Some(EventKind::Fail), "")
            .unwrap();
        store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Fail), 4000,
                CacheSource::Live, Some(EventKind::Fail), "")
            .unwrap();
        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.last_seen, 5000);
        assert_eq!(row.first_seen, 4000);
    }

    #[test]
    fn test_deltas_and_imports_accumulate_independently() {
        let store = create_test_store();
        let addr = ip("198.51.100.4");

        // Interleave live deltas with import folds: live counters and
        // import aggregates must not bleed into each other.
        store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Ban), 1000,
                CacheSource::Live, Some(EventKind::Ban), "sshd")
            .unwrap();
        store.upsert_imported(&addr, 7, 500, Some(900), "sshd").unwrap();
        store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Ban), 2000,
                CacheSource::Live, Some(EventKind::Ban), "sshd")
            .unwrap();
        store.upsert_imported(&addr, 2, 1500, Some(1600), "postfix").unwrap();

        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.counts.ban, 2);
        assert_eq!(row.ban_count_total, 9);
        assert_eq!(row.last_ban_ts, Some(1600));
        assert_eq!(row.last_ban_jail, "postfix");
        assert_eq!(row.first_seen, 500);
        assert_eq!(row.last_seen, 2000);
    }

    #[test]
    fn test_imported_older_ban_does_not_regress_last_ban() {
        let store = create_test_store();
        let addr = ip("198.51.100.4");
        store.upsert_imported(&addr, 1, 5000, Some(5000), "sshd").unwrap();
        store.upsert_imported(&addr, 1, 100, Some(100), "old-jail").unwrap();
        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.ban_count_total, 2);
        assert_eq!(row.last_ban_ts, Some(5000));
        assert_eq!(row.last_ban_jail, "sshd");
        assert_eq!(row.first_seen, 100);
    }

    #[test]
    fn test_list_rows_ordering() {
        let store = create_test_store();
        // b has more bans; a has imported history dominating.
        store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts { ban: 2, ..Default::default() },
                1000, CacheSource::Live, Some(EventKind::Ban), "")
            .unwrap();
        store.upsert_imported(&ip("10.0.0.2"), 50, 500, Some(900), "sshd").unwrap();

        let rows = store.list_rows("", 10).unwrap();
        assert_eq!(rows[0].ip, ip("10.0.0.2"));
        assert_eq!(rows[1].ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_list_rows_search() {
        let store = create_test_store();
        store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        store
            .upsert_delta(&ip("192.0.2.7"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        let rows = store.list_rows("192.0", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, ip("192.0.2.7"));
    }

    #[test]
    fn test_rows_seen_since_window() {
        let store = create_test_store();
        for (addr, ts) in [("10.0.0.1", 100), ("10.0.0.2", 200), ("10.0.0.3", 300)] {
            store
                .upsert_delta(&ip(addr), &EventCounts::one(EventKind::Fail), ts,
                    CacheSource::Live, None, "")
                .unwrap();
        }
        let rows = store.rows_seen_since(200).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.last_seen >= 200));
    }

    #[test]
    fn test_top_rows_by_score() {
        let store = create_test_store();
        store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts { ban: 1, ..Default::default() },
                10, CacheSource::Live, None, "")
            .unwrap();
        store
            .upsert_delta(&ip("10.0.0.2"), &EventCounts { fail: 2, ..Default::default() },
                20, CacheSource::Live, None, "")
            .unwrap();
        // ban=3 > 2 fails=2
        let rows = store.top_rows_by_score(&ScoreWeights::default(), 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_recent_ips() {
        let store = create_test_store();
        for (addr, ts) in [("10.0.0.1", 100), ("10.0.0.2", 300), ("10.0.0.3", 200)] {
            store
                .upsert_delta(&ip(addr), &EventCounts::one(EventKind::Fail), ts,
                    CacheSource::Live, None, "")
                .unwrap();
        }
        let ips = store.recent_ips(2).unwrap();
        assert_eq!(ips, vec![ip("10.0.0.2"), ip("10.0.0.3")]);
    }

    #[test]
    fn test_asn_roundtrip() {
        let store = create_test_store();
        let rec = record("203.0.113.9", 1000);
        store.upsert_asn(&rec).unwrap();
        assert_eq!(store.get_asn(&rec.ip).unwrap().unwrap(), rec);
    }

    #[test]
    fn test_asn_last_fetched_wins() {
        let store = create_test_store();
        let newer = record("203.0.113.9", 2000);
        let mut older = record("203.0.113.9", 1000);
        older.asn = "64501".to_string();

        store.upsert_asn(&newer).unwrap();
        // An out-of-order, earlier fetch must not overwrite.
        store.upsert_asn(&older).unwrap();
        assert_eq!(store.get_asn(&newer.ip).unwrap().unwrap(), newer);
    }

    #[test]
    fn test_ips_needing_asn_sweep() {
        let store = create_test_store();
        let ttl = 1000;
        let negative_ttl = 100;
        let now = 10_000;

        // never looked up
        store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        // fresh
        store
            .upsert_delta(&ip("10.0.0.2"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        store.upsert_asn(&record("10.0.0.2", now - 10)).unwrap();
        // stale positive
        store
            .upsert_delta(&ip("10.0.0.3"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        store.upsert_asn(&record("10.0.0.3", now - ttl - 1)).unwrap();
        // negative within its (shorter) ttl
        store
            .upsert_delta(&ip("10.0.0.4"), &EventCounts::one(EventKind::Fail), 1,
                CacheSource::Live, None, "")
            .unwrap();
        let mut neg = record("10.0.0.4", now - 50);
        neg.resolved = false;
        store.upsert_asn(&neg).unwrap();

        let need = store.ips_needing_asn(now, ttl, negative_ttl, 10, None).unwrap();
        assert_eq!(need, vec![ip("10.0.0.1"), ip("10.0.0.3")]);

        // Cursor pages past already-returned IPs.
        let after = store
            .ips_needing_asn(now, ttl, negative_ttl, 10, Some(&ip("10.0.0.1")))
            .unwrap();
        assert_eq!(after, vec![ip("10.0.0.3")]);
    }

    #[test]
    fn test_asn_summary_groups_by_asn() {
        let store = create_test_store();
        for (addr, bans) in [("10.0.0.1", 2u64), ("10.0.0.2", 1u64)] {
            store
                .upsert_delta(&ip(addr), &EventCounts { ban: bans, ..Default::default() },
                    100, CacheSource::Live, None, "")
                .unwrap();
            store.upsert_asn(&record(addr, 1000)).unwrap();
        }
        let mut other = record("192.0.2.1", 1000);
        other.asn = "64999".to_string();
        store
            .upsert_delta(&ip("192.0.2.1"), &EventCounts::one(EventKind::Fail), 100,
                CacheSource::Live, None, "")
            .unwrap();
        store.upsert_asn(&other).unwrap();

        let summary = store.asn_summary("", 10).unwrap();
        assert_eq!(summary.len(), 2);
        let top = &summary[0];
        assert_eq!(top.asn, "64500");
        assert_eq!(top.ip_count, 2);
        assert_eq!(top.counts.ban, 3);
    }

    #[test]
    fn test_ips_in_asn() {
        let store = create_test_store();
        store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts::one(EventKind::Ban), 100,
                CacheSource::Live, None, "")
            .unwrap();
        store.upsert_asn(&record("10.0.0.1", 1000)).unwrap();
        store
            .upsert_delta(&ip("192.0.2.1"), &EventCounts::one(EventKind::Ban), 100,
                CacheSource::Live, None, "")
            .unwrap();

        let rows = store.ips_in_asn("64500", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_state_roundtrip() {
        let store = create_test_store();
        assert!(store.get_state("import_hwm").unwrap().is_none());
        store.set_state("import_hwm", "12345").unwrap();
        assert_eq!(store.get_state("import_hwm").unwrap().unwrap(), "12345");
        store.set_state("import_hwm", "23456").unwrap();
        assert_eq!(store.get_state("import_hwm").unwrap().unwrap(), "23456");
    }

    #[test]
    fn test_ipv6_rows() {
        let store = create_test_store();
        let addr = ip("2001:db8::1");
        store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Ban), 100,
                CacheSource::Live, Some(EventKind::Ban), "sshd")
            .unwrap();
        let row = store.get_row(&addr).unwrap().unwrap();
        assert_eq!(row.ip, addr);
        assert_eq!(row.counts.ban, 1);
    }

    #[test]
    fn test_empty_store_is_valid() {
        let store = create_test_store();
        assert!(store.list_rows("", 10).unwrap().is_empty());
        assert!(store.get_row(&ip("10.0.0.1")).unwrap().is_none());
        assert!(store.recent_ips(5).unwrap().is_empty());
    }
}
