pub mod asn;
pub mod cache;
pub mod config;
pub mod history;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod query;
pub mod realtime;
pub mod subnet;
pub mod tailer;

// Re-export commonly used types
pub use asn::{AsnPipeline, AsnProvider, CymruWhoisProvider, IntervalGate};
pub use cache::{CacheStore, SqliteCacheStore};
pub use config::Config;
pub use ingest::Monitor;
pub use models::{AsnRecord, AsnStatus, Event, EventCounts, EventKind, SubnetKey};
pub use parser::EventParser;
pub use query::{QueryFacade, SubnetSource};
pub use realtime::RealtimeAggregator;
pub use tailer::{LogSource, LogTailer};
