//! Read-only query surface for the view layer.
//!
//! Composes the realtime aggregator, the persistent cache, the subnet
//! rollup and the ASN pipeline into consistent views. Nothing here
//! mutates state, with one indirect exception: asking for details of
//! an IP whose ASN record is Unknown or stale queues a lookup.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::asn::AsnPipeline;
use crate::cache::{AsnSummaryRow, CacheError, CacheStore};
use crate::config::Config;
use crate::history::{BanHistoryRow, Fail2banDb};
use crate::models::{AsnStatus, CacheRow, Event, IpStats, ScoreWeights, SubnetKey};
use crate::realtime::{Notice, RealtimeAggregator, RealtimeSnapshot};
use crate::subnet::{self, IpAggregate, SubnetAggregate};

/// Which data horizon a subnet rollup draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetSource {
    Realtime,
    Cached,
    Both,
}

/// Everything known about one IP, across every horizon.
#[derive(Debug, Clone, Serialize)]
pub struct IpDetails {
    pub ip: IpAddr,
    pub realtime: Option<IpStats>,
    pub cached: Option<CacheRow>,
    pub asn: AsnStatus,
    pub history: Vec<BanHistoryRow>,
    pub recent_events: Vec<Event>,
    pub subnet: SubnetKey,
    /// 1-based rank within the current top-subnets view, if present.
    pub top_subnet_rank: Option<usize>,
}

/// Drill-down for one subnet.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetDetails {
    pub subnet: SubnetKey,
    pub aggregate: Option<SubnetAggregate>,
    pub top_subnet_rank: Option<usize>,
    pub top_ips: Vec<CacheRow>,
}

/// Drill-down for one ASN.
#[derive(Debug, Clone, Serialize)]
pub struct AsnDetails {
    pub asn: String,
    pub summary: Option<AsnSummaryRow>,
    pub top_ips: Vec<CacheRow>,
}

/// One line of the merged event/notice feed, newest last.
#[derive(Debug, Clone, Serialize)]
pub enum FeedItem {
    Event(Event),
    Notice(Notice),
}

impl FeedItem {
    pub fn timestamp(&self) -> i64 {
        match self {
            FeedItem::Event(e) => e.timestamp,
            FeedItem::Notice(n) => n.timestamp,
        }
    }
}

/// The single read API the rendering layer consumes.
pub struct QueryFacade {
    realtime: Arc<RwLock<RealtimeAggregator>>,
    store: Arc<dyn CacheStore>,
    asn: Arc<AsnPipeline>,
    history: Fail2banDb,
    prefix_v4: u8,
    prefix_v6: u8,
    top_n: usize,
    weights: ScoreWeights,
    asn_enabled: bool,
}

impl QueryFacade {
    pub fn new(
        config: &Config,
        realtime: Arc<RwLock<RealtimeAggregator>>,
        store: Arc<dyn CacheStore>,
        asn: Arc<AsnPipeline>,
        history: Fail2banDb,
    ) -> Self {
        QueryFacade {
            realtime,
            store,
            asn,
            history,
            prefix_v4: config.aggregation.subnet_prefix_v4,
            prefix_v6: config.aggregation.subnet_prefix_v6,
            top_n: config.aggregation.top_subnets,
            weights: config.aggregation.weights,
            asn_enabled: config.asn.enable,
        }
    }

    fn snapshot(&self) -> RealtimeSnapshot {
        self.realtime.read().unwrap().snapshot()
    }

    /// Live IPs with activity since process start, worst-first.
    pub fn realtime_rows(&self, search: &str) -> Vec<IpStats> {
        let needle = search.to_lowercase();
        let mut rows: Vec<IpStats> = self
            .snapshot()
            .stats
            .into_iter()
            .filter(|s| needle.is_empty() || s.ip.to_string().contains(&needle))
            .collect();
        rows.sort_by(|a, b| {
            b.counts
                .ban
                .cmp(&a.counts.ban)
                .then_with(|| b.counts.fail.cmp(&a.counts.fail))
                .then_with(|| b.counts.total().cmp(&a.counts.total()))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        rows
    }

    /// Historical rows from the cache, worst-first.
    pub fn cached_rows(&self, search: &str, limit: usize) -> Result<Vec<CacheRow>, CacheError> {
        self.store.list_rows(search, limit)
    }

    /// Top-N cached IPs by weighted score.
    pub fn top_ips(&self, n: usize) -> Result<Vec<CacheRow>, CacheError> {
        self.store.top_rows_by_score(&self.weights, n)
    }

    /// Top-N subnet rollup over the chosen horizon.
    pub fn top_subnets(&self, source: SubnetSource) -> Result<Vec<SubnetAggregate>, CacheError> {
        let rows = self.subnet_inputs(source)?;
        Ok(subnet::aggregate(
            &rows,
            self.prefix_v4,
            self.prefix_v6,
            &self.weights,
            self.top_n,
        ))
    }

    fn subnet_inputs(&self, source: SubnetSource) -> Result<Vec<IpAggregate>, CacheError> {
        let mut rows = Vec::new();
        match source {
            SubnetSource::Realtime => {
                for s in self.snapshot().stats {
                    rows.push(IpAggregate {
                        ip: s.ip,
                        counts: s.counts,
                        last_seen: s.last_seen,
                    });
                }
            }
            SubnetSource::Cached => {
                for r in self.store.rows_seen_since(0)? {
                    rows.push(IpAggregate {
                        ip: r.ip,
                        counts: r.counts,
                        last_seen: r.last_seen,
                    });
                }
            }
            SubnetSource::Both => {
                // The cache already includes every live upsert, so a
                // cached row subsumes the realtime counters for the
                // same IP; realtime-only IPs (dropped upserts) are
                // added on top. Nothing is counted twice.
                let cached = self.store.rows_seen_since(0)?;
                let known: std::collections::HashSet<IpAddr> =
                    cached.iter().map(|r| r.ip).collect();
                for r in &cached {
                    rows.push(IpAggregate {
                        ip: r.ip,
                        counts: r.counts,
                        last_seen: r.last_seen,
                    });
                }
                for s in self.snapshot().stats {
                    if !known.contains(&s.ip) {
                        rows.push(IpAggregate {
                            ip: s.ip,
                            counts: s.counts,
                            last_seen: s.last_seen,
                        });
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Per-ASN rollup of cached rows.
    pub fn asn_summary(&self, search: &str, limit: usize) -> Result<Vec<AsnSummaryRow>, CacheError> {
        self.store.asn_summary(search, limit)
    }

    /// The merged details view for one IP. May queue an ASN lookup if
    /// the record is Unknown or stale; triggers no other mutation.
    pub fn ip_details(&self, ip: &IpAddr, now: i64) -> Result<IpDetails, CacheError> {
        let snapshot = self.snapshot();
        let realtime = snapshot.stats_for(ip).cloned();
        let cached = self.store.get_row(ip)?;

        let asn = self.asn.status_for(ip, now)?;
        if self.asn_enabled
            && matches!(asn, AsnStatus::Unknown | AsnStatus::Stale(_))
            && self.asn.request(*ip)
        {
            log::debug!("queued asn lookup for {}", ip);
        }

        // History read failures degrade to an empty section; the
        // fail2ban db being locked or absent must not fail the view.
        let history = match self.history.ip_history(ip, Some(50)) {
            Ok(rows) => rows,
            Err(e) => {
                log::debug!("history read failed for {}: {}", ip, e);
                Vec::new()
            }
        };

        let recent_events = snapshot.events_for(ip).into_iter().cloned().collect();

        let subnet = SubnetKey::of(*ip, self.prefix_v4, self.prefix_v6);
        let top_subnet_rank = self
            .top_subnets(SubnetSource::Both)?
            .iter()
            .position(|a| a.subnet == subnet)
            .map(|i| i + 1);

        Ok(IpDetails {
            ip: *ip,
            realtime,
            cached,
            asn,
            history,
            recent_events,
            subnet,
            top_subnet_rank,
        })
    }

    /// Drill-down for a subnet key taken from the top-subnets view.
    pub fn subnet_details(&self, subnet: &SubnetKey) -> Result<SubnetDetails, CacheError> {
        let rows = self.subnet_inputs(SubnetSource::Both)?;
        let all = subnet::aggregate(&rows, self.prefix_v4, self.prefix_v6, &self.weights, usize::MAX);
        let aggregate = all.iter().find(|a| a.subnet == *subnet).cloned();
        let top_subnet_rank = all
            .iter()
            .take(self.top_n)
            .position(|a| a.subnet == *subnet)
            .map(|i| i + 1);

        let mut top_ips: Vec<CacheRow> = self
            .store
            .rows_seen_since(0)?
            .into_iter()
            .filter(|r| SubnetKey::of(r.ip, self.prefix_v4, self.prefix_v6) == *subnet)
            .collect();
        top_ips.sort_by(|a, b| {
            b.ban_count_total
                .cmp(&a.ban_count_total)
                .then_with(|| b.counts.ban.cmp(&a.counts.ban))
                .then_with(|| b.counts.fail.cmp(&a.counts.fail))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        top_ips.truncate(50);

        Ok(SubnetDetails {
            subnet: *subnet,
            aggregate,
            top_subnet_rank,
            top_ips,
        })
    }

    /// Drill-down for one ASN.
    pub fn asn_details(&self, asn: &str) -> Result<AsnDetails, CacheError> {
        let summary = self
            .store
            .asn_summary(asn, 10)?
            .into_iter()
            .find(|row| row.asn == asn);
        let top_ips = self.store.ips_in_asn(asn, 50)?;
        Ok(AsnDetails {
            asn: asn.to_string(),
            summary,
            top_ips,
        })
    }

    /// Merged event/notice feed, oldest first, bounded by `max`.
    pub fn events(&self, max: usize) -> Vec<FeedItem> {
        let snapshot = self.snapshot();
        let mut feed: Vec<FeedItem> = snapshot
            .recent_events
            .into_iter()
            .map(FeedItem::Event)
            .chain(snapshot.notices.into_iter().map(FeedItem::Notice))
            .collect();
        feed.sort_by_key(|item| item.timestamp());
        if feed.len() > max {
            feed.drain(..feed.len() - max);
        }
        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn::{IntervalGate, ProviderAnswer};
    use crate::cache::SqliteCacheStore;
    use crate::models::{CacheSource, EventCounts, EventKind};
    use crate::parser::EventParser;
    use crate::realtime::NoticeLevel;
    use std::time::{Duration, Instant};

    const NOW: i64 = 1_769_700_000;

    struct Fixture {
        facade: QueryFacade,
        realtime: Arc<RwLock<RealtimeAggregator>>,
        store: Arc<SqliteCacheStore>,
        asn: Arc<AsnPipeline>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let realtime = Arc::new(RwLock::new(RealtimeAggregator::new(
            config.input.recent_events,
        )));
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let asn = Arc::new(AsnPipeline::new(
            store.clone(),
            config.asn.batch_size,
            config.asn.ttl_secs,
            config.asn.negative_ttl_secs,
            IntervalGate::new(Duration::from_secs(config.asn.refresh_interval_secs)),
        ));
        // A nonexistent fail2ban db: history degrades to empty.
        let history = Fail2banDb::open(dir.path().join("fail2ban.sqlite3"));
        let facade = QueryFacade::new(&config, realtime.clone(), store.clone(), asn.clone(), history);
        Fixture {
            facade,
            realtime,
            store,
            asn,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_end_to_end_ban_line() {
        let fx = fixture();
        let parser = EventParser::new("sshd");

        // Feed the parser a fail2ban Ban line and record the event.
        let event = parser.parse_fail2ban_line("Ban 203.0.113.9", NOW).unwrap();
        assert_eq!(event.kind, EventKind::Ban);
        assert_eq!(event.ip, ip("203.0.113.9"));
        fx.realtime.write().unwrap().record(&event);
        fx.store
            .upsert_delta(&event.ip, &EventCounts::one(event.kind), event.timestamp,
                CacheSource::Live, Some(event.kind), &event.jail)
            .unwrap();

        let details = fx.facade.ip_details(&event.ip, NOW).unwrap();
        let rt = details.realtime.expect("realtime counters present");
        assert_eq!(rt.counts.ban, 1);
        assert_eq!(details.cached.unwrap().counts.ban, 1);
        assert_eq!(details.recent_events.len(), 1);
        assert_eq!(details.subnet.to_string(), "203.0.113.0/24");
    }

    #[test]
    fn test_details_enqueue_asn_when_unknown() {
        let fx = fixture();
        let addr = ip("203.0.113.9");
        let details = fx.facade.ip_details(&addr, NOW).unwrap();
        assert_eq!(details.asn, AsnStatus::Unknown);

        // The lookup was queued: a second details call sees Pending.
        let details = fx.facade.ip_details(&addr, NOW).unwrap();
        assert_eq!(details.asn, AsnStatus::Pending);
    }

    #[test]
    fn test_details_requeue_on_stale() {
        let fx = fixture();
        let addr = ip("203.0.113.9");
        let batch = {
            fx.asn.request(addr);
            fx.asn.take_batch(Instant::now()).unwrap()
        };
        fx.asn.complete_batch(
            &batch,
            vec![ProviderAnswer {
                ip: addr,
                asn: "64500".to_string(),
                country: "US".to_string(),
                organization: "EXAMPLE".to_string(),
            }],
            NOW,
        );

        // Fresh within TTL: served as-is, nothing queued.
        let details = fx.facade.ip_details(&addr, NOW + 1).unwrap();
        assert!(matches!(details.asn, AsnStatus::Fresh(_)));
        assert_eq!(fx.asn.pending_len(), 0);

        // Past the TTL: still served (stale) but re-queued.
        let ttl = Config::default().asn.ttl_secs;
        let details = fx.facade.ip_details(&addr, NOW + ttl + 1).unwrap();
        assert!(matches!(details.asn, AsnStatus::Stale(_)));
        assert_eq!(fx.asn.pending_len(), 1);
    }

    #[test]
    fn test_realtime_rows_sorted_and_searchable() {
        let fx = fixture();
        {
            let mut rt = fx.realtime.write().unwrap();
            for (addr, kind, n) in [
                ("10.0.0.1", EventKind::Fail, 5),
                ("10.0.0.2", EventKind::Ban, 1),
                ("192.0.2.1", EventKind::Fail, 2),
            ] {
                for i in 0..n {
                    rt.record(&Event {
                        ip: ip(addr),
                        jail: "sshd".to_string(),
                        kind,
                        timestamp: NOW + i,
                        raw_line: String::new(),
                    });
                }
            }
        }

        let rows = fx.facade.realtime_rows("");
        assert_eq!(rows[0].ip, ip("10.0.0.2")); // ban outranks fails
        assert_eq!(rows[1].ip, ip("10.0.0.1"));

        let filtered = fx.facade.realtime_rows("192.0");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].ip, ip("192.0.2.1"));
    }

    #[test]
    fn test_top_subnets_sources() {
        let fx = fixture();
        // Cached: one subnet via the store.
        fx.store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts { ban: 2, ..Default::default() },
                NOW, CacheSource::Live, None, "")
            .unwrap();
        // Realtime-only IP (upsert dropped): different subnet.
        fx.realtime.write().unwrap().record(&Event {
            ip: ip("192.0.2.1"),
            jail: String::new(),
            kind: EventKind::Fail,
            timestamp: NOW,
            raw_line: String::new(),
        });

        let cached = fx.facade.top_subnets(SubnetSource::Cached).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].subnet.to_string(), "10.0.0.0/24");

        let realtime = fx.facade.top_subnets(SubnetSource::Realtime).unwrap();
        assert_eq!(realtime.len(), 1);
        assert_eq!(realtime[0].subnet.to_string(), "192.0.2.0/24");

        let both = fx.facade.top_subnets(SubnetSource::Both).unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].subnet.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_both_source_does_not_double_count() {
        let fx = fixture();
        let addr = ip("10.0.0.1");
        // The same ban flowed through both paths, as in live ingest.
        let event = Event {
            ip: addr,
            jail: "sshd".to_string(),
            kind: EventKind::Ban,
            timestamp: NOW,
            raw_line: String::new(),
        };
        fx.realtime.write().unwrap().record(&event);
        fx.store
            .upsert_delta(&addr, &EventCounts::one(EventKind::Ban), NOW,
                CacheSource::Live, Some(EventKind::Ban), "sshd")
            .unwrap();

        let both = fx.facade.top_subnets(SubnetSource::Both).unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].counts.ban, 1);
        assert_eq!(both[0].unique_ip_count, 1);
    }

    #[test]
    fn test_subnet_details() {
        let fx = fixture();
        fx.store
            .upsert_delta(&ip("10.0.0.1"), &EventCounts { ban: 2, ..Default::default() },
                NOW, CacheSource::Live, None, "")
            .unwrap();
        fx.store
            .upsert_delta(&ip("10.0.0.9"), &EventCounts { fail: 1, ..Default::default() },
                NOW, CacheSource::Live, None, "")
            .unwrap();

        let key = SubnetKey::of(ip("10.0.0.1"), 24, 64);
        let details = fx.facade.subnet_details(&key).unwrap();
        let agg = details.aggregate.unwrap();
        assert_eq!(agg.unique_ip_count, 2);
        assert_eq!(details.top_subnet_rank, Some(1));
        assert_eq!(details.top_ips.len(), 2);
        assert_eq!(details.top_ips[0].ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_events_feed_merges_notices() {
        let fx = fixture();
        {
            let mut rt = fx.realtime.write().unwrap();
            rt.record(&Event {
                ip: ip("10.0.0.1"),
                jail: String::new(),
                kind: EventKind::Fail,
                timestamp: NOW,
                raw_line: String::new(),
            });
            rt.notice(NoticeLevel::Info, NOW + 1, "log rotated");
        }
        let feed = fx.facade.events(10);
        assert_eq!(feed.len(), 2);
        assert!(matches!(feed[0], FeedItem::Event(_)));
        assert!(matches!(feed[1], FeedItem::Notice(_)));
    }
}
