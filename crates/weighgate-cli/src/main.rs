//! `weighgate` – weighing station service.
//!
//! ```text
//! weighgate                    run the station until Ctrl-C
//! weighgate summary [DATE]     print the day summary (UTC, YYYY-MM-DD, default today)
//! weighgate config             print the effective configuration
//! ```
//!
//! On first start a default `~/.weighgate/config.toml` is written.  The
//! scale is always the simulator running a looping load cycle; the panel is
//! the simulator or a serial port depending on `system.hardware`.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use colored::Colorize;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use weighgate_hal::SignalLink;
use weighgate_hal::serial_panel::SerialPanel;
use weighgate_hal::sim::{SimPanel, SimScale, load_cycle};
use weighgate_memory::{SqliteRepository, WeighingRepository};
use weighgate_runtime::{Station, init_tracing};
use weighgate_types::{StationError, SystemClock};

use config::{Config, Hardware};

/// Loads the simulated scale cycles through, in kilograms.
const DEMO_LOADS: [f64; 4] = [12.4, 3.2, 48.9, 25.0];

fn main() -> ExitCode {
    let _telemetry = init_tracing("weighgate");
    let args: Vec<String> = std::env::args().skip(1).collect();

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match args.first().map(String::as_str) {
        None | Some("run") => run(&cfg),
        Some("summary") => print_summary(&cfg, args.get(1).map(String::as_str)),
        Some("config") => print_config(&cfg),
        Some("help" | "--help" | "-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("{} '{}'", "Unknown command".red(), other);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "weighgate exited with an error");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Load (or create) the config file and validate it.
fn load_config() -> Result<Config, String> {
    let cfg = match config::load()? {
        Some(cfg) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        None => {
            let mut cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Station
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: &Config) -> Result<(), StationError> {
    print_banner();

    let (stop_tx, stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the station …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| StationError::InvalidConfig(format!("cannot start async runtime: {e}")))?;
    runtime.block_on(serve(cfg, stop_rx))
}

async fn serve(cfg: &Config, mut stop: watch::Receiver<bool>) -> Result<(), StationError> {
    let repo = SqliteRepository::open(&cfg.database.path, &cfg.database.table)?;

    let (scale, scale_sim) = SimScale::new(cfg.scale.port.as_str());
    scale_sim.load_script(load_cycle(&DEMO_LOADS), true);

    let panel: Box<dyn SignalLink> = match cfg.system.hardware {
        Hardware::Serial => Box::new(SerialPanel::new(cfg.panel.port.as_str(), cfg.panel.baud_rate)),
        Hardware::Sim => Box::new(SimPanel::new(cfg.panel.port.as_str()).0),
    };

    let station = Station::new(
        Box::new(scale),
        panel,
        Box::new(repo),
        Arc::new(SystemClock),
        cfg.station_config(),
    );
    let states = station.subscribe_states();
    let observer = tokio::spawn(print_states(states));

    station.start().await?;
    println!(
        "  Station running (panel: {} on {}, database: {}). Press {} to stop.\n",
        cfg.system.hardware.to_string().bold(),
        cfg.panel.port.dimmed(),
        cfg.database.path.dimmed(),
        "Ctrl-C".bold().cyan()
    );

    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }

    station.stop().await;
    observer.abort();
    let pending = station.store().queue_len();
    if pending > 0 {
        println!(
            "  {} {} weighing(s) were still queued and are lost.",
            "⚠".yellow().bold(),
            pending
        );
    }
    println!("{}", "  ✓ Station stopped.".green());
    Ok(())
}

async fn print_states(mut states: broadcast::Receiver<weighgate_types::StateChange>) {
    loop {
        match states.recv().await {
            Ok(change) => println!(
                "  {} {} → {}",
                Utc::now().format("%H:%M:%S%.3f").to_string().dimmed(),
                change.from.to_string().dimmed(),
                change.to.to_string().bold()
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("  {}", format!("({n} state changes skipped)").dimmed());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(cfg: &Config, date: Option<&str>) -> Result<(), StationError> {
    let day = match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| StationError::InvalidConfig(format!("invalid date '{s}': {e}")))?,
        None => Utc::now().date_naive(),
    };
    let from = day.and_time(NaiveTime::MIN).and_utc();
    let to = from + chrono::Duration::days(1);

    let repo = SqliteRepository::open(&cfg.database.path, &cfg.database.table)?;
    let summary = repo.summary_between(from, to)?;

    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |w| format!("{w:.2}"));
    println!();
    println!("  {} {}", "Weighings on".bold(), day.to_string().bold().cyan());
    println!("    count   : {}", summary.count);
    println!("    total   : {:.2}", summary.total);
    println!("    min     : {}", fmt(summary.min));
    println!("    max     : {}", fmt(summary.max));
    println!("    average : {}", fmt(summary.average));
    println!();
    Ok(())
}

fn print_config(cfg: &Config) -> Result<(), StationError> {
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| StationError::InvalidConfig(format!("cannot render config: {e}")))?;
    println!("# {}", config::config_path().display());
    println!("{raw}");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _      __    _      __             __     "#.bold().cyan());
    println!("{}", r#" | | /| / /__ (_)__ _/ /  ___ ____ _/ /____ "#.bold().cyan());
    println!("{}", r#" | |/ |/ / -_) / _ `/ _ \/ _ `/ _ `/ __/ -_)"#.bold().cyan());
    println!("{}", r#" |__/|__/\__/_/\_, /_//_/\_, /\_,_/\__/\__/ "#.bold().cyan());
    println!("{}", r#"              /___/     /___/              "#.bold().cyan());
    println!();
    println!("  {} v{}", "Weighgate".bold(), env!("CARGO_PKG_VERSION"));
    println!();
}

fn print_usage() {
    println!("Usage:");
    println!("  {}                 run the station until Ctrl-C", "weighgate".bold());
    println!("  {} [YYYY-MM-DD]  day summary from the database", "weighgate summary".bold());
    println!("  {}          print the effective configuration", "weighgate config".bold());
}
