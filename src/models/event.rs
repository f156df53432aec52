use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Closed set of event kinds the pipeline understands.
///
/// Every consumer matches exhaustively; adding a variant is a
/// compile-visible change across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Fail,
    Ok,
    Ban,
    Unban,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Fail => "FAIL",
            EventKind::Ok => "OK",
            EventKind::Ban => "BAN",
            EventKind::Unban => "UNBAN",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "FAIL" => Some(EventKind::Fail),
            "OK" => Some(EventKind::Ok),
            "BAN" => Some(EventKind::Ban),
            "UNBAN" => Some(EventKind::Unban),
            _ => None,
        }
    }
}

/// A single parsed log event. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ip: IpAddr,
    pub jail: String,
    pub kind: EventKind,
    /// Epoch seconds, UTC.
    pub timestamp: i64,
    pub raw_line: String,
}

/// Per-kind counters. The same type serves as a realtime tally, a
/// persistence delta and a persisted cumulative row, so accumulation
/// stays commutative and associative no matter which path adds first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub fail: u64,
    pub ok: u64,
    pub ban: u64,
    pub unban: u64,
}

impl EventCounts {
    /// A delta representing exactly one event.
    pub fn one(kind: EventKind) -> Self {
        let mut c = EventCounts::default();
        c.increment(kind);
        c
    }

    pub fn increment(&mut self, kind: EventKind) {
        match kind {
            EventKind::Fail => self.fail += 1,
            EventKind::Ok => self.ok += 1,
            EventKind::Ban => self.ban += 1,
            EventKind::Unban => self.unban += 1,
        }
    }

    pub fn merge(&mut self, other: &EventCounts) {
        self.fail += other.fail;
        self.ok += other.ok;
        self.ban += other.ban;
        self.unban += other.unban;
    }

    pub fn total(&self) -> u64 {
        self.fail + self.ok + self.ban + self.unban
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// Realtime per-IP statistics. Lives only in memory; rebuilt from
/// nothing on restart, historical continuity comes from the cache.
#[derive(Debug, Clone, Serialize)]
pub struct IpStats {
    pub ip: IpAddr,
    pub counts: EventCounts,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_kind: Option<EventKind>,
    pub last_jail: String,
}

/// Where a cache row was last written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSource {
    Live,
    Imported,
}

impl CacheSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheSource::Live => "live",
            CacheSource::Imported => "imported",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "live" => Some(CacheSource::Live),
            "imported" => Some(CacheSource::Imported),
            _ => None,
        }
    }
}

/// Persistent per-IP aggregate.
///
/// Live counters (`counts`) and imported history aggregates
/// (`ban_count_total`, `last_ban_*`) are kept in separate fields so
/// an event that was observed live and is also present in the
/// fail2ban history store is never added to the same counter twice.
#[derive(Debug, Clone, Serialize)]
pub struct CacheRow {
    pub ip: IpAddr,
    pub counts: EventCounts,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_kind: Option<EventKind>,
    pub last_jail: String,
    pub source: CacheSource,
    pub ban_count_total: u64,
    pub last_ban_ts: Option<i64>,
    pub last_ban_jail: String,
}

/// Cached provider (ASN) record for one IP.
///
/// `resolved == false` marks a negative answer: the provider had no
/// record. Negative rows carry their own, shorter TTL so consistently
/// unresolvable addresses are not re-queried every sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnRecord {
    pub ip: IpAddr,
    pub asn: String,
    pub country: String,
    pub organization: String,
    pub fetched_at: i64,
    pub resolved: bool,
}

impl AsnRecord {
    /// A record past its TTL is stale: still servable, but due for a
    /// re-fetch before being trusted for display.
    pub fn is_stale(&self, now: i64, ttl: i64, negative_ttl: i64) -> bool {
        let horizon = if self.resolved { ttl } else { negative_ttl };
        now - self.fetched_at > horizon
    }
}

/// Enrichment state for one IP as seen by the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AsnStatus {
    Unknown,
    Pending,
    Fresh(AsnRecord),
    Stale(AsnRecord),
}
