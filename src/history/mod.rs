//! fail2ban history import.
//!
//! Reads fail2ban's own sqlite database (read-only) and folds ban
//! history into the cache's dedicated import columns. A persisted
//! high-water mark (the greatest `timeofban` already folded) makes
//! the importer idempotent: re-running over an unchanged store is a
//! no-op, and a restart never double-counts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use crate::cache::{CacheError, CacheStore};

/// State-table key holding the high-water mark.
pub const HWM_KEY: &str = "import_hwm";

/// Errors that can occur while reading or importing history
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("fail2ban database has no bips or bans table")]
    MissingSchema,
}

/// One historical ban as recorded by fail2ban.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BanHistoryRow {
    pub jail: String,
    pub timeofban: i64,
    pub bantime: i64,
    pub bancount: i64,
}

/// Read-only access to fail2ban's persisted store.
///
/// fail2ban's schema varies across versions: newer ones keep a `bips`
/// table (optionally with a `bancount` column), older ones only
/// `bans`. Connections are opened per call so a fail2ban vacuum or
/// rewrite between imports cannot wedge a long-lived handle.
pub struct Fail2banDb {
    path: PathBuf,
}

impl Fail2banDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Fail2banDb {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, ImportError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    fn table_exists(conn: &Connection, name: &str) -> Result<bool, ImportError> {
        let mut stmt = conn.prepare(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
        )?;
        Ok(stmt.exists(params![name])?)
    }

    fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, ImportError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|n| n == column))
    }

    fn source_table(conn: &Connection) -> Result<&'static str, ImportError> {
        if Self::table_exists(conn, "bips")? {
            return Ok("bips");
        }
        if Self::table_exists(conn, "bans")? {
            return Ok("bans");
        }
        Err(ImportError::MissingSchema)
    }

    /// `bancount` and `bantime` vary across fail2ban versions; select
    /// a constant when a column is absent.
    fn optional_columns(
        conn: &Connection,
        table: &str,
    ) -> Result<(&'static str, &'static str), ImportError> {
        let bancount = if Self::has_column(conn, table, "bancount")? {
            "bancount"
        } else {
            "1"
        };
        let bantime = if Self::has_column(conn, table, "bantime")? {
            "bantime"
        } else {
            "0"
        };
        Ok((bancount, bantime))
    }

    /// All ban rows with `timeofban > after`, oldest first. Rows with
    /// an unparseable IP are skipped (bad unit, not a failed read).
    pub fn bans_after(&self, after: i64) -> Result<Vec<(IpAddr, BanHistoryRow)>, ImportError> {
        let conn = self.connect()?;
        let table = Self::source_table(&conn)?;
        let (bancount_col, bantime_col) = Self::optional_columns(&conn, table)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT ip, jail, timeofban, {}, {} FROM {}
             WHERE timeofban > ?1
             ORDER BY timeofban ASC",
            bantime_col, bancount_col, table
        ))?;
        let raw = stmt
            .query_map(params![after], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    BanHistoryRow {
                        jail: row.get(1)?,
                        timeofban: row.get(2)?,
                        bantime: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        bancount: row.get::<_, Option<i64>>(4)?.unwrap_or(1),
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (ip_str, row) in raw {
            match IpAddr::from_str(&ip_str) {
                Ok(ip) => rows.push((ip, row)),
                Err(_) => log::debug!("skipping history row with bad ip {:?}", ip_str),
            }
        }
        Ok(rows)
    }

    /// Per-ban history for one IP, newest first.
    pub fn ip_history(
        &self,
        ip: &IpAddr,
        limit: Option<usize>,
    ) -> Result<Vec<BanHistoryRow>, ImportError> {
        let conn = self.connect()?;
        let table = Self::source_table(&conn)?;
        let (bancount_col, bantime_col) = Self::optional_columns(&conn, table)?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT jail, timeofban, {}, {} FROM {}
             WHERE ip = ?1
             ORDER BY timeofban DESC
             LIMIT ?2",
            bantime_col, bancount_col, table
        ))?;
        let rows = stmt
            .query_map(params![ip.to_string(), limit], |row| {
                Ok(BanHistoryRow {
                    jail: row.get(0)?,
                    timeofban: row.get(1)?,
                    bantime: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    bancount: row.get::<_, Option<i64>>(3)?.unwrap_or(1),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Result of one import pass.
#[derive(Debug, Clone, Copy)]
pub struct ImportSummary {
    pub rows_scanned: usize,
    pub ips_updated: usize,
    pub high_water_mark: i64,
}

/// Per-IP fold of the rows a pass will import.
#[derive(Debug, Default)]
struct ImportedAggregate {
    ban_count: u64,
    first_ban_ts: i64,
    last_ban_ts: i64,
    last_ban_jail: String,
}

/// Folds unseen fail2ban history into the cache store.
pub struct HistoryImporter {
    db: Fail2banDb,
    store: Arc<dyn CacheStore>,
}

impl HistoryImporter {
    pub fn new(db: Fail2banDb, store: Arc<dyn CacheStore>) -> Self {
        HistoryImporter { db, store }
    }

    /// One import pass: read rows past the high-water mark, fold them
    /// per IP, upsert, advance the mark. Safe to re-run any number of
    /// times.
    pub fn run_once(&self) -> Result<ImportSummary, ImportError> {
        let hwm = self
            .store
            .get_state(HWM_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let rows = self.db.bans_after(hwm)?;
        if rows.is_empty() {
            return Ok(ImportSummary {
                rows_scanned: 0,
                ips_updated: 0,
                high_water_mark: hwm,
            });
        }

        let mut new_hwm = hwm;
        let mut per_ip: HashMap<IpAddr, ImportedAggregate> = HashMap::new();
        for (ip, row) in &rows {
            new_hwm = new_hwm.max(row.timeofban);
            let agg = per_ip.entry(*ip).or_insert_with(|| ImportedAggregate {
                first_ban_ts: row.timeofban,
                ..Default::default()
            });
            agg.ban_count += row.bancount.max(1) as u64;
            agg.first_ban_ts = agg.first_ban_ts.min(row.timeofban);
            if row.timeofban >= agg.last_ban_ts {
                agg.last_ban_ts = row.timeofban;
                agg.last_ban_jail = row.jail.clone();
            }
        }

        let ips_updated = per_ip.len();
        for (ip, agg) in per_ip {
            self.store.upsert_imported(
                &ip,
                agg.ban_count,
                agg.first_ban_ts,
                Some(agg.last_ban_ts),
                &agg.last_ban_jail,
            )?;
        }

        self.store.set_state(HWM_KEY, &new_hwm.to_string())?;
        log::info!(
            "imported fail2ban history: {} rows, {} IPs, hwm {}",
            rows.len(),
            ips_updated,
            new_hwm
        );
        Ok(ImportSummary {
            rows_scanned: rows.len(),
            ips_updated,
            high_water_mark: new_hwm,
        })
    }
}
