use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use structopt::StructOpt;
use tokio::sync::watch;

use banwatch::config::Config;
use banwatch::ingest::Monitor;
use banwatch::parser::EventParser;
use banwatch::query::{FeedItem, SubnetSource};

/// banwatch daemon: fail2ban/sshd activity monitor
#[derive(StructOpt, Debug)]
#[structopt(name = "banwatchd", about = "fail2ban/sshd activity monitor daemon")]
enum Cli {
    /// Run the monitor pipeline
    Run {
        /// Path to configuration file
        #[structopt(short, long, default_value = "banwatch.toml")]
        config: PathBuf,
        /// Write a JSON status snapshot to this path periodically
        #[structopt(long)]
        status_file: Option<PathBuf>,
        /// Seconds between status snapshots
        #[structopt(long, default_value = "5")]
        status_interval: u64,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "banwatch.toml")]
        output: PathBuf,
    },
    /// Parse a log file and print the events it yields
    Parse {
        /// Path to log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Treat the file as a fail2ban log instead of an auth log
        #[structopt(long)]
        fail2ban: bool,
        /// Maximum number of events to print
        #[structopt(short, long, default_value = "20")]
        lines: usize,
    },
}

/// What the `--status-file` snapshot contains.
#[derive(Serialize)]
struct StatusDump {
    generated_at: i64,
    realtime: Vec<banwatch::models::IpStats>,
    top_ips: Vec<banwatch::models::CacheRow>,
    top_subnets: Vec<banwatch::subnet::SubnetAggregate>,
    feed: Vec<FeedItem>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    match Cli::from_args() {
        Cli::Run {
            config,
            status_file,
            status_interval,
        } => run(config, status_file, status_interval).await,
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
            Ok(())
        }
        Cli::Parse {
            file,
            fail2ban,
            lines,
        } => parse_file(file, fail2ban, lines),
    }
}

async fn run(
    config_path: PathBuf,
    status_file: Option<PathBuf>,
    status_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("starting banwatchd...");

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("config file {:?} not found, using defaults", config_path);
        Config::default()
    };
    // Configuration problems are fatal here and nowhere else.
    config.validate()?;

    let mut monitor = Monitor::new(config)?;
    let facade = monitor.facade();
    monitor.start();
    log::info!("pipeline running; press Ctrl+C to stop");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    let interval = Duration::from_secs(status_interval.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => {}
        }
        if *stop_rx.borrow() {
            break;
        }
        if let Err(e) = write_status(&facade, status_file.as_deref()) {
            log::warn!("status snapshot failed: {}", e);
        }
    }

    log::info!("shutting down, flushing buffered work...");
    monitor.signal_shutdown();
    monitor.join().await;
    log::info!("banwatchd stopped");
    Ok(())
}

fn write_status(
    facade: &banwatch::QueryFacade,
    status_file: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let realtime = facade.realtime_rows("");
    let top_subnets = facade.top_subnets(SubnetSource::Both)?;
    log::info!(
        "status: {} live IPs, {} hot subnets",
        realtime.len(),
        top_subnets.len()
    );

    if let Some(path) = status_file {
        let dump = StatusDump {
            generated_at: Utc::now().timestamp(),
            realtime,
            top_ips: facade.top_ips(50)?,
            top_subnets,
            feed: facade.events(200),
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&dump)?)?;
        std::fs::rename(&tmp, path)?;
    }
    Ok(())
}

fn parse_file(
    file: PathBuf,
    fail2ban: bool,
    lines: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(&file)?;
    let parser = EventParser::new("sshd");
    let now = Utc::now().timestamp();

    let mut shown = 0;
    for line in contents.lines() {
        let event = if fail2ban {
            parser.parse_fail2ban_line(line, now)
        } else {
            parser.parse_auth_line(line, now)
        };
        if let Some(event) = event {
            println!(
                "  {} {} ip={} jail={}",
                event.timestamp,
                event.kind.label(),
                event.ip,
                event.jail
            );
            shown += 1;
            if shown >= lines {
                break;
            }
        }
    }
    println!("\n{} event(s) shown from {:?}", shown, file);
    Ok(())
}
