//! Worker wiring.
//!
//! One tailer task per log file feeds a bounded channel; a single
//! ingest task owns all realtime writes and performs cache upserts
//! with bounded retry. The history importer and the ASN worker run as
//! their own tasks. [`Monitor`] assembles the whole pipeline and owns
//! shutdown.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::asn::{AsnPipeline, CymruWhoisProvider, IntervalGate};
use crate::cache::{CacheError, CacheStore, SqliteCacheStore};
use crate::config::Config;
use crate::history::{Fail2banDb, HistoryImporter};
use crate::models::{Event, EventCounts, EventKind};
use crate::parser::EventParser;
use crate::query::QueryFacade;
use crate::realtime::{NoticeLevel, RealtimeAggregator};
use crate::tailer::{LogSource, LogTailer, TailItem, TailMessage};

const CHANNEL_CAPACITY: usize = 1024;
const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_BACKOFF_MS: u64 = 50;

/// Parses tail output and folds events into the realtime aggregator
/// and the cache. The only writer of either.
pub struct Ingestor {
    parser: EventParser,
    realtime: Arc<RwLock<RealtimeAggregator>>,
    store: Arc<dyn CacheStore>,
    show_ok: bool,
}

impl Ingestor {
    pub fn new(
        parser: EventParser,
        realtime: Arc<RwLock<RealtimeAggregator>>,
        store: Arc<dyn CacheStore>,
        show_ok: bool,
    ) -> Self {
        Ingestor {
            parser,
            realtime,
            store,
            show_ok,
        }
    }

    /// Consume tail messages until every tailer is gone. The channel
    /// drains fully before this returns, so buffered events are
    /// committed on shutdown.
    pub async fn run(self, mut rx: mpsc::Receiver<TailMessage>) {
        log::info!("ingest task started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        log::info!("ingest task stopped");
    }

    pub async fn handle(&self, msg: TailMessage) {
        let now = Utc::now().timestamp();
        match msg.item {
            TailItem::Rotated => {
                self.realtime.write().unwrap().notice(
                    NoticeLevel::Info,
                    now,
                    format!("{} log rotated; earlier history unreliable", msg.source.label()),
                );
            }
            TailItem::Line(line) => {
                let event = match msg.source {
                    LogSource::Auth => self.parser.parse_auth_line(&line, now),
                    LogSource::Fail2ban => self.parser.parse_fail2ban_line(&line, now),
                };
                if let Some(event) = event {
                    if event.kind == EventKind::Ok && !self.show_ok {
                        return;
                    }
                    self.record(&event).await;
                }
            }
        }
    }

    async fn record(&self, event: &Event) {
        self.realtime.write().unwrap().record(event);
        self.upsert_with_retry(event).await;
    }

    /// Cache writes retry with backoff; after the last attempt the
    /// delta is dropped and a degradation notice is surfaced instead
    /// of failing the pipeline (counts may undercount, process lives).
    async fn upsert_with_retry(&self, event: &Event) {
        let delta = EventCounts::one(event.kind);
        for attempt in 1..=UPSERT_ATTEMPTS {
            match self.store.upsert_delta(
                &event.ip,
                &delta,
                event.timestamp,
                crate::models::CacheSource::Live,
                Some(event.kind),
                &event.jail,
            ) {
                Ok(()) => return,
                Err(e) if attempt < UPSERT_ATTEMPTS => {
                    log::warn!("cache upsert failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(UPSERT_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(e) => {
                    self.realtime.write().unwrap().notice(
                        NoticeLevel::Error,
                        event.timestamp,
                        format!("cache upsert dropped for {}: {}", event.ip, e),
                    );
                }
            }
        }
    }
}

/// One import pass off the async runtime, with its outcome surfaced
/// as a notice.
async fn import_pass(
    importer: Arc<HistoryImporter>,
    realtime: Arc<RwLock<RealtimeAggregator>>,
) {
    let result = tokio::task::spawn_blocking(move || importer.run_once()).await;
    let now = Utc::now().timestamp();
    match result {
        Ok(Ok(summary)) if summary.rows_scanned > 0 => {
            realtime.write().unwrap().notice(
                NoticeLevel::Info,
                now,
                format!(
                    "imported fail2ban history: {} rows, {} IPs",
                    summary.rows_scanned, summary.ips_updated
                ),
            );
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            realtime.write().unwrap().notice(
                NoticeLevel::Error,
                now,
                format!("fail2ban history import failed: {}", e),
            );
        }
        Err(e) => log::error!("import task panicked: {}", e),
    }
}

/// Importer worker: one pass at startup when configured, then
/// periodic re-runs if an interval is set. Never blocks ingestion.
pub async fn run_importer(
    importer: Arc<HistoryImporter>,
    realtime: Arc<RwLock<RealtimeAggregator>>,
    on_start: bool,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if on_start {
        import_pass(importer.clone(), realtime.clone()).await;
    }
    if interval_secs == 0 {
        return;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        import_pass(importer.clone(), realtime.clone()).await;
    }
}

/// The assembled pipeline: all components plus their worker tasks.
pub struct Monitor {
    config: Config,
    realtime: Arc<RwLock<RealtimeAggregator>>,
    store: Arc<SqliteCacheStore>,
    asn: Arc<AsnPipeline>,
    facade: Arc<QueryFacade>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Build every component from a validated config. Opens (or
    /// creates) the cache and seeds the realtime view from it.
    pub fn new(config: Config) -> Result<Self, CacheError> {
        let store = Arc::new(SqliteCacheStore::new(&config.cache.path)?);
        let realtime = Arc::new(RwLock::new(RealtimeAggregator::new(
            config.input.recent_events,
        )));

        if config.cache.bootstrap_rows > 0 {
            let seeds = store.recent_ips(config.cache.bootstrap_rows)?;
            let now = Utc::now().timestamp();
            let mut rt = realtime.write().unwrap();
            for ip in &seeds {
                rt.seed(*ip, now);
            }
            log::info!("seeded realtime view with {} cached IPs", seeds.len());
        }

        let asn = Arc::new(AsnPipeline::new(
            store.clone(),
            config.asn.batch_size,
            config.asn.ttl_secs,
            config.asn.negative_ttl_secs,
            IntervalGate::new(Duration::from_secs(config.asn.refresh_interval_secs)),
        ));

        let facade = Arc::new(QueryFacade::new(
            &config,
            realtime.clone(),
            store.clone(),
            asn.clone(),
            Fail2banDb::open(&config.import.fail2ban_db),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Monitor {
            config,
            realtime,
            store,
            asn,
            facade,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn facade(&self) -> Arc<QueryFacade> {
        self.facade.clone()
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn tailers, ingest, importer and the ASN worker.
    pub fn start(&mut self) {
        let poll = Duration::from_millis(self.config.input.poll_interval_ms);
        let (tx, rx) = mpsc::channel::<TailMessage>(CHANNEL_CAPACITY);

        for (source, path) in [
            (LogSource::Auth, self.config.input.auth_log.clone()),
            (LogSource::Fail2ban, self.config.input.fail2ban_log.clone()),
        ] {
            let tailer = LogTailer::new(path, true);
            self.tasks.push(tokio::spawn(tailer.run(
                source,
                tx.clone(),
                self.shutdown_tx.subscribe(),
                poll,
            )));
        }
        // Only tailer tasks hold senders: when they stop, the ingest
        // channel closes and the ingest task drains out.
        drop(tx);

        let ingestor = Ingestor::new(
            EventParser::new(&self.config.input.jail),
            self.realtime.clone(),
            self.store.clone(),
            self.config.input.show_ok,
        );
        self.tasks.push(tokio::spawn(ingestor.run(rx)));

        let store: Arc<dyn CacheStore> = self.store.clone();
        let importer = Arc::new(HistoryImporter::new(
            Fail2banDb::open(&self.config.import.fail2ban_db),
            store,
        ));
        self.tasks.push(tokio::spawn(run_importer(
            importer,
            self.realtime.clone(),
            self.config.import.on_start,
            self.config.import.interval_secs,
            self.shutdown_tx.subscribe(),
        )));

        if self.config.asn.enable {
            let provider = Arc::new(CymruWhoisProvider::new(
                &self.config.asn.whois_host,
                self.config.asn.whois_port,
                Duration::from_secs(self.config.asn.timeout_secs),
            ));
            self.tasks.push(tokio::spawn(
                self.asn.clone().run(provider, self.shutdown_tx.subscribe()),
            ));
        }
    }

    /// Ask every worker to stop at its next suspension point.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all workers to finish (ingest drains its channel
    /// first, so buffered events are committed before exit).
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("worker task failed: {}", e);
            }
        }
    }
}
