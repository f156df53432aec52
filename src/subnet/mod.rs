//! Subnet-level rollups.
//!
//! Derived on demand from per-IP aggregates; nothing here is stored.
//! The same computation serves realtime, cached and merged inputs.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{EventCounts, ScoreWeights, SubnetKey};

/// Per-IP input row for a rollup: where it came from is the caller's
/// concern, only counts and recency matter here.
#[derive(Debug, Clone)]
pub struct IpAggregate {
    pub ip: std::net::IpAddr,
    pub counts: EventCounts,
    pub last_seen: i64,
}

/// One subnet's rollup. Pure view; no lifecycle of its own.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetAggregate {
    pub subnet: SubnetKey,
    pub unique_ip_count: usize,
    pub counts: EventCounts,
    pub score: u64,
    pub last_activity: i64,
}

/// Mask, group, sum, score, rank.
///
/// Deterministic: sorted by score desc, then last_activity desc, then
/// subnet key (lexicographic) for full tie-breaking; truncated to
/// `top_n`.
pub fn aggregate(
    rows: &[IpAggregate],
    prefix_v4: u8,
    prefix_v6: u8,
    weights: &ScoreWeights,
    top_n: usize,
) -> Vec<SubnetAggregate> {
    let mut groups: HashMap<SubnetKey, SubnetAggregate> = HashMap::new();

    for row in rows {
        let key = SubnetKey::of(row.ip, prefix_v4, prefix_v6);
        let entry = groups.entry(key).or_insert_with(|| SubnetAggregate {
            subnet: key,
            unique_ip_count: 0,
            counts: EventCounts::default(),
            score: 0,
            last_activity: row.last_seen,
        });
        entry.unique_ip_count += 1;
        entry.counts.merge(&row.counts);
        entry.last_activity = entry.last_activity.max(row.last_seen);
    }

    let mut out: Vec<SubnetAggregate> = groups
        .into_values()
        .map(|mut agg| {
            agg.score = weights.score(&agg.counts);
            agg
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_activity.cmp(&a.last_activity))
            .then_with(|| a.subnet.to_string().cmp(&b.subnet.to_string()))
    });
    out.truncate(top_n);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::str::FromStr;

    fn row(ip: &str, counts: EventCounts, last_seen: i64) -> IpAggregate {
        IpAggregate {
            ip: IpAddr::from_str(ip).unwrap(),
            counts,
            last_seen,
        }
    }

    #[test]
    fn test_grouping_and_scoring() {
        // 10.0.0.0/24: 2 bans (score 6) across two IPs.
        // 10.0.1.0/24: 5 fails (score 5) from one IP.
        let rows = vec![
            row("10.0.0.1", EventCounts { ban: 2, ..Default::default() }, 100),
            row("10.0.0.2", EventCounts { fail: 1, ..Default::default() }, 200),
            row("10.0.1.5", EventCounts { fail: 5, ..Default::default() }, 300),
        ];
        let out = aggregate(&rows, 24, 64, &ScoreWeights::default(), 10);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subnet.to_string(), "10.0.0.0/24");
        assert_eq!(out[0].score, 2 * 3 + 1);
        assert_eq!(out[0].unique_ip_count, 2);
        assert_eq!(out[0].last_activity, 200);
        assert_eq!(out[1].subnet.to_string(), "10.0.1.0/24");
        assert_eq!(out[1].score, 5);
        assert_eq!(out[1].unique_ip_count, 1);
    }

    #[test]
    fn test_tie_break_on_recency_then_key() {
        let one_fail = EventCounts { fail: 1, ..Default::default() };
        // Equal scores: the more recently active subnet ranks first.
        let rows = vec![
            row("10.0.0.1", one_fail, 100),
            row("10.0.1.1", one_fail, 500),
        ];
        let out = aggregate(&rows, 24, 64, &ScoreWeights::default(), 10);
        assert_eq!(out[0].subnet.to_string(), "10.0.1.0/24");

        // Equal score and recency: lexicographic key order.
        let rows = vec![
            row("10.0.2.1", one_fail, 100),
            row("10.0.1.1", one_fail, 100),
        ];
        let out = aggregate(&rows, 24, 64, &ScoreWeights::default(), 10);
        assert_eq!(out[0].subnet.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_top_n_truncation() {
        let rows: Vec<IpAggregate> = (0..5)
            .map(|i| {
                row(
                    &format!("10.0.{}.1", i),
                    EventCounts { fail: 5 - i as u64, ..Default::default() },
                    100,
                )
            })
            .collect();
        let out = aggregate(&rows, 24, 64, &ScoreWeights::default(), 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subnet.to_string(), "10.0.0.0/24");
        assert_eq!(out[1].subnet.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_custom_weights() {
        let weights = ScoreWeights { ban: 0, fail: 0, unban: 1, ok: 1 };
        let rows = vec![
            row("10.0.0.1", EventCounts { ban: 9, ..Default::default() }, 100),
            row("10.0.1.1", EventCounts { ok: 1, ..Default::default() }, 100),
        ];
        let out = aggregate(&rows, 24, 64, &weights, 10);
        assert_eq!(out[0].subnet.to_string(), "10.0.1.0/24");
        assert_eq!(out[0].score, 1);
        assert_eq!(out[1].score, 0);
    }

    #[test]
    fn test_mixed_families_group_separately() {
        let one_fail = EventCounts { fail: 1, ..Default::default() };
        let rows = vec![
            row("10.0.0.1", one_fail, 100),
            row("2001:db8:0:1::5", one_fail, 100),
            row("2001:db8:0:1::6", one_fail, 100),
        ];
        let out = aggregate(&rows, 24, 64, &ScoreWeights::default(), 10);
        assert_eq!(out.len(), 2);
        let v6 = out
            .iter()
            .find(|a| a.subnet.to_string() == "2001:db8:0:1::/64")
            .unwrap();
        assert_eq!(v6.unique_ip_count, 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(&[], 24, 64, &ScoreWeights::default(), 10).is_empty());
    }
}
