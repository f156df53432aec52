//! Persistent aggregation cache.
//!
//! The cache is the only durable state this process owns: per-IP
//! cumulative counters, imported fail2ban history aggregates, ASN
//! records with TTL, and the importer's high-water mark. Subnet
//! rollups are deliberately not stored; they are derived on query.

pub mod store;

pub use store::SqliteCacheStore;

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

use crate::models::{AsnRecord, CacheRow, CacheSource, EventCounts, EventKind, ScoreWeights};

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in cache: {0}")]
    InvalidData(String),
}

/// One ASN as aggregated across all cached IPs that resolve to it.
#[derive(Debug, Clone, Serialize)]
pub struct AsnSummaryRow {
    pub asn: String,
    pub organization: String,
    pub country: String,
    pub ip_count: u64,
    pub counts: EventCounts,
    pub ban_total_sum: u64,
    pub last_fetched: i64,
}

/// Durable per-IP aggregation keyed by IP.
///
/// Implementations must make every upsert atomic and additive so the
/// live-ingestion path, the history importer and the ASN pipeline can
/// write concurrently without losing counts.
pub trait CacheStore: Send + Sync {
    // =====================
    // Live counters
    // =====================

    /// Fold an event delta into the row for `ip`. Additive: counts
    /// never overwrite, `last_seen` takes the max, `first_seen` the
    /// min of existing and new.
    #[allow(clippy::too_many_arguments)]
    fn upsert_delta(
        &self,
        ip: &IpAddr,
        delta: &EventCounts,
        timestamp: i64,
        source: CacheSource,
        last_kind: Option<EventKind>,
        last_jail: &str,
    ) -> Result<(), CacheError>;

    // =====================
    // Imported history aggregates
    // =====================

    /// Fold imported fail2ban history into the dedicated import
    /// columns. `ban_count_delta` covers history rows never folded
    /// before (the importer's high-water mark guarantees that), so it
    /// adds; `last_ban_*` keep the most recent value.
    fn upsert_imported(
        &self,
        ip: &IpAddr,
        ban_count_delta: u64,
        first_ban_ts: i64,
        last_ban_ts: Option<i64>,
        last_ban_jail: &str,
    ) -> Result<(), CacheError>;

    // =====================
    // Row queries
    // =====================

    fn get_row(&self, ip: &IpAddr) -> Result<Option<CacheRow>, CacheError>;

    /// Rows matching `search` (substring of the IP; empty matches
    /// all), ordered worst-first.
    fn list_rows(&self, search: &str, limit: usize) -> Result<Vec<CacheRow>, CacheError>;

    /// All rows with `last_seen >= since`.
    fn rows_seen_since(&self, since: i64) -> Result<Vec<CacheRow>, CacheError>;

    /// Top `n` rows by weighted score.
    fn top_rows_by_score(&self, weights: &ScoreWeights, n: usize)
        -> Result<Vec<CacheRow>, CacheError>;

    /// The `n` most recently seen IPs (realtime bootstrap seed).
    fn recent_ips(&self, n: usize) -> Result<Vec<IpAddr>, CacheError>;

    // =====================
    // ASN records
    // =====================

    /// Write an ASN record. A record fetched earlier than the stored
    /// one never overwrites it (last-fetched-at wins).
    fn upsert_asn(&self, record: &AsnRecord) -> Result<(), CacheError>;

    fn get_asn(&self, ip: &IpAddr) -> Result<Option<AsnRecord>, CacheError>;

    /// Cached IPs whose ASN record is missing or past its TTL,
    /// ordered by IP, starting after `cursor` when given. Feeds the
    /// enrichment sweep.
    fn ips_needing_asn(
        &self,
        now: i64,
        ttl: i64,
        negative_ttl: i64,
        limit: usize,
        cursor: Option<&IpAddr>,
    ) -> Result<Vec<IpAddr>, CacheError>;

    /// Aggregate cached rows per ASN (resolved records only).
    fn asn_summary(&self, search: &str, limit: usize) -> Result<Vec<AsnSummaryRow>, CacheError>;

    /// Cached rows whose resolved ASN equals `asn`, worst-first.
    fn ips_in_asn(&self, asn: &str, limit: usize) -> Result<Vec<CacheRow>, CacheError>;

    // =====================
    // Importer state
    // =====================

    fn get_state(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn set_state(&self, key: &str, value: &str) -> Result<(), CacheError>;
}
