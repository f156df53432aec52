//! In-memory realtime aggregation.
//!
//! Process-lifetime counters per IP plus a bounded ring of recent
//! events. Nothing here is persisted: on restart the aggregator is
//! rebuilt from nothing and historical continuity comes from the
//! persistent cache. The ingest task is the only writer; the view
//! side reads through [`RealtimeAggregator::snapshot`].

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use serde::Serialize;

use crate::models::{Event, EventCounts, IpStats};

const NOTICE_CAPACITY: usize = 100;

/// Severity of a system notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Out-of-band pipeline status line (rotation detected, import
/// finished, upsert dropped). Notices are not events and never touch
/// the counters.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub timestamp: i64,
    pub level: NoticeLevel,
    pub message: String,
}

/// Immutable copy of the aggregator state, safe to hand to the view
/// layer while ingestion continues.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeSnapshot {
    pub stats: Vec<IpStats>,
    pub recent_events: Vec<Event>,
    pub notices: Vec<Notice>,
}

impl RealtimeSnapshot {
    /// Recent events for one IP, oldest first.
    pub fn events_for(&self, ip: &IpAddr) -> Vec<&Event> {
        self.recent_events.iter().filter(|e| e.ip == *ip).collect()
    }

    pub fn stats_for(&self, ip: &IpAddr) -> Option<&IpStats> {
        self.stats.iter().find(|s| s.ip == *ip)
    }
}

/// Single-writer realtime counters and recent-event ring.
pub struct RealtimeAggregator {
    stats: HashMap<IpAddr, IpStats>,
    recent: VecDeque<Event>,
    notices: VecDeque<Notice>,
    capacity: usize,
}

impl RealtimeAggregator {
    /// `capacity` bounds the recent-events ring (FIFO, oldest out).
    pub fn new(capacity: usize) -> Self {
        RealtimeAggregator {
            stats: HashMap::new(),
            recent: VecDeque::with_capacity(capacity),
            notices: VecDeque::new(),
            capacity,
        }
    }

    /// O(1) fold of one event into the per-IP stats and the ring.
    pub fn record(&mut self, event: &Event) {
        let entry = self.stats.entry(event.ip).or_insert_with(|| IpStats {
            ip: event.ip,
            counts: EventCounts::default(),
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            last_kind: None,
            last_jail: String::new(),
        });
        entry.counts.increment(event.kind);
        entry.last_seen = entry.last_seen.max(event.timestamp);
        entry.last_kind = Some(event.kind);
        if !event.jail.is_empty() {
            entry.last_jail = event.jail.clone();
        }

        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(event.clone());
    }

    /// Pre-register an IP with zero counters (cache bootstrap seed).
    /// Seeded entries stay invisible to snapshots until a live event
    /// arrives for them.
    pub fn seed(&mut self, ip: IpAddr, last_seen: i64) {
        self.stats.entry(ip).or_insert_with(|| IpStats {
            ip,
            counts: EventCounts::default(),
            first_seen: last_seen,
            last_seen,
            last_kind: None,
            last_jail: String::new(),
        });
    }

    /// Append a system notice (bounded ring of its own).
    pub fn notice(&mut self, level: NoticeLevel, timestamp: i64, message: impl Into<String>) {
        if self.notices.len() == NOTICE_CAPACITY {
            self.notices.pop_front();
        }
        let message = message.into();
        match level {
            NoticeLevel::Info => log::info!("{}", message),
            NoticeLevel::Error => log::warn!("{}", message),
        }
        self.notices.push_back(Notice {
            timestamp,
            level,
            message,
        });
    }

    /// Number of distinct IPs observed (seeded entries included).
    pub fn ip_count(&self) -> usize {
        self.stats.len()
    }

    /// Copy-on-read view. Zero-count (seeded, never-hit) entries are
    /// omitted.
    pub fn snapshot(&self) -> RealtimeSnapshot {
        RealtimeSnapshot {
            stats: self
                .stats
                .values()
                .filter(|s| !s.counts.is_zero())
                .cloned()
                .collect(),
            recent_events: self.recent.iter().cloned().collect(),
            notices: self.notices.iter().cloned().collect(),
        }
    }
}
