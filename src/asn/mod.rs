//! ASN enrichment pipeline.
//!
//! Per-IP lifecycle: Unknown → Pending → Fetched(fresh) →
//! Fetched(stale) → Pending again. Requests collapse while Pending,
//! batches go out under a process-wide interval gate, results land in
//! the cache with last-fetched-at-wins semantics, and addresses the
//! provider cannot resolve are cached as negative results with a
//! shorter TTL.

pub mod provider;

pub use provider::{AsnProvider, CymruWhoisProvider, ProviderAnswer};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::{CacheError, CacheStore};
use crate::models::{AsnRecord, AsnStatus};

/// Errors that can occur during provider lookups
#[derive(Error, Debug)]
pub enum AsnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider timed out")]
    Timeout,

    #[error("malformed provider response")]
    Malformed,
}

/// Process-wide pacing gate: at most one acquisition per interval.
///
/// Owned and injected explicitly (no hidden timer) so tests can drive
/// it with simulated instants.
#[derive(Debug)]
pub struct IntervalGate {
    min_interval: Duration,
    last: Option<Instant>,
}

impl IntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        IntervalGate {
            min_interval,
            last: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

struct PipelineState {
    pending: VecDeque<IpAddr>,
    pending_set: HashSet<IpAddr>,
    inflight: HashSet<IpAddr>,
    gate: IntervalGate,
    sweep_cursor: Option<IpAddr>,
}

/// Batching, dedup and TTL bookkeeping for provider lookups.
pub struct AsnPipeline {
    store: Arc<dyn CacheStore>,
    batch_size: usize,
    ttl: i64,
    negative_ttl: i64,
    state: Mutex<PipelineState>,
}

impl AsnPipeline {
    pub fn new(
        store: Arc<dyn CacheStore>,
        batch_size: usize,
        ttl: i64,
        negative_ttl: i64,
        gate: IntervalGate,
    ) -> Self {
        AsnPipeline {
            store,
            batch_size,
            ttl,
            negative_ttl,
            state: Mutex::new(PipelineState {
                pending: VecDeque::new(),
                pending_set: HashSet::new(),
                inflight: HashSet::new(),
                gate,
                sweep_cursor: None,
            }),
        }
    }

    /// Queue an IP for lookup. Requests for an already-Pending IP
    /// collapse into one; returns whether the IP was newly queued.
    pub fn request(&self, ip: IpAddr) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.pending_set.contains(&ip) || st.inflight.contains(&ip) {
            return false;
        }
        st.pending.push_back(ip);
        st.pending_set.insert(ip);
        true
    }

    pub fn pending_len(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.pending.len() + st.inflight.len()
    }

    /// Take the next batch if one is due: there is pending work and
    /// the gate allows a request at `now`. Taken IPs move to inflight
    /// and the gate is consumed.
    pub fn take_batch(&self, now: Instant) -> Option<Vec<IpAddr>> {
        let mut st = self.state.lock().unwrap();
        if st.pending.is_empty() || !st.gate.ready(now) {
            return None;
        }
        let n = self.batch_size.min(st.pending.len());
        let batch: Vec<IpAddr> = st.pending.drain(..n).collect();
        for ip in &batch {
            st.pending_set.remove(ip);
            st.inflight.insert(*ip);
        }
        st.gate.mark(now);
        Some(batch)
    }

    /// Fold a successful provider response into the cache. Batch
    /// members the provider had no answer for become negative records.
    /// Returns (asked, resolved).
    pub fn complete_batch(
        &self,
        batch: &[IpAddr],
        answers: Vec<ProviderAnswer>,
        fetched_at: i64,
    ) -> (usize, usize) {
        let answered: HashMap<IpAddr, ProviderAnswer> =
            answers.into_iter().map(|a| (a.ip, a)).collect();

        let mut resolved = 0;
        for ip in batch {
            let record = match answered.get(ip) {
                Some(a) => {
                    resolved += 1;
                    AsnRecord {
                        ip: *ip,
                        asn: a.asn.clone(),
                        country: a.country.clone(),
                        organization: a.organization.clone(),
                        fetched_at,
                        resolved: true,
                    }
                }
                None => AsnRecord {
                    ip: *ip,
                    asn: String::new(),
                    country: String::new(),
                    organization: String::new(),
                    fetched_at,
                    resolved: false,
                },
            };
            if let Err(e) = self.store.upsert_asn(&record) {
                log::warn!("asn cache write failed for {}: {}", ip, e);
            }
        }

        let mut st = self.state.lock().unwrap();
        for ip in batch {
            st.inflight.remove(ip);
        }
        (batch.len(), resolved)
    }

    /// A failed batch (network error, malformed response) leaves all
    /// members Pending for the next window. Nothing is cached.
    pub fn fail_batch(&self, batch: &[IpAddr]) {
        let mut st = self.state.lock().unwrap();
        for ip in batch {
            st.inflight.remove(ip);
        }
        for ip in batch.iter().rev() {
            if !st.pending_set.contains(ip) {
                st.pending.push_front(*ip);
                st.pending_set.insert(*ip);
            }
        }
    }

    /// Enrichment state for one IP as of `now` (epoch seconds).
    pub fn status_for(&self, ip: &IpAddr, now: i64) -> Result<AsnStatus, CacheError> {
        {
            let st = self.state.lock().unwrap();
            if st.pending_set.contains(ip) || st.inflight.contains(ip) {
                return Ok(AsnStatus::Pending);
            }
        }
        match self.store.get_asn(ip)? {
            None => Ok(AsnStatus::Unknown),
            Some(rec) => {
                if rec.is_stale(now, self.ttl, self.negative_ttl) {
                    Ok(AsnStatus::Stale(rec))
                } else {
                    Ok(AsnStatus::Fresh(rec))
                }
            }
        }
    }

    /// Pull cached IPs with missing or expired records into the
    /// pending queue, rotating a cursor through the keyspace so every
    /// IP gets its turn.
    pub fn sweep(&self, now: i64) -> Result<usize, CacheError> {
        let cursor = {
            let st = self.state.lock().unwrap();
            st.sweep_cursor
        };
        let mut need = self.store.ips_needing_asn(
            now,
            self.ttl,
            self.negative_ttl,
            self.batch_size,
            cursor.as_ref(),
        )?;
        if need.is_empty() && cursor.is_some() {
            // End of keyspace: wrap around once.
            need = self
                .store
                .ips_needing_asn(now, self.ttl, self.negative_ttl, self.batch_size, None)?;
        }

        let mut queued = 0;
        let last = need.last().copied();
        for ip in need {
            if self.request(ip) {
                queued += 1;
            }
        }
        let mut st = self.state.lock().unwrap();
        st.sweep_cursor = last;
        Ok(queued)
    }

    /// Worker loop: sweep, dispatch at most one gated batch per tick,
    /// write results. A provider failure requeues the batch and the
    /// loop keeps running. Shutdown is honored between suspension
    /// points; an in-flight request finishes under its own timeout.
    pub async fn run(
        self: Arc<Self>,
        provider: Arc<dyn AsnProvider>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("asn worker started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.sweep(Utc::now().timestamp()) {
                log::warn!("asn sweep failed: {}", e);
            }

            if let Some(batch) = self.take_batch(Instant::now()) {
                match provider.lookup_batch(&batch).await {
                    Ok(answers) => {
                        let (asked, resolved) =
                            self.complete_batch(&batch, answers, Utc::now().timestamp());
                        log::debug!("asn refresh: asked={} resolved={}", asked, resolved);
                    }
                    Err(e) => {
                        log::warn!("asn batch failed ({} IPs), will retry: {}", batch.len(), e);
                        self.fail_batch(&batch);
                    }
                }
            }
        }
        log::info!("asn worker stopped");
    }
}
