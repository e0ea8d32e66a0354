//! Vehicle Signal Manager CLI
//!
//! Command-line frontend for the vsm-policy engine. It adds everything the
//! library deliberately leaves out:
//! - stdin/stdout transport (`name = value` in, `< ts,name,id,value` out)
//! - wall-clock scheduling of timers and delayed emissions
//! - capture-log recording and scaled-time replay
//! - violation-log file writing

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use vsm_policy::rules::parser::load_initial_state;
use vsm_policy::PolicyEngine;

mod driver;

const REPLAY_RATE_MAX: f64 = 10000.0;

/// Vehicle Signal Manager - rule-driven signal processing
#[derive(Parser, Debug)]
#[command(name = "vsm")]
#[command(about = "Evaluate policy rules over a stream of vehicle signals", long_about = None)]
#[command(version)]
struct Args {
    /// YAML rules configuration
    rules: PathBuf,

    /// .vsi file which maps all signal names to numbers
    #[arg(long, value_name = "FILE")]
    signal_number_file: PathBuf,

    /// Initial state, YAML list of "name = value" entries
    #[arg(long, value_name = "FILE")]
    initial_state: Option<PathBuf>,

    /// Write violation reports to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Record received and emitted signals to this capture log
    #[arg(long, value_name = "FILE")]
    capture_log: Option<PathBuf>,

    /// Use a capture log to replay signal traffic in real or scaled time
    #[arg(long, value_name = "FILE")]
    replay_log_file: Option<PathBuf>,

    /// The rate at which to play back the replay log, as a percentage of
    /// originally-recorded timing (50 = half speed, 200 = double speed)
    #[arg(long, default_value_t = 100.0)]
    replay_rate: f64,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!(
        "VSM v{} (policy library v{})",
        env!("CARGO_PKG_VERSION"),
        vsm_policy::VERSION
    );

    if !(args.replay_rate > 0.0 && args.replay_rate <= REPLAY_RATE_MAX) {
        bail!(
            "replay rate must be greater than 0 and at most {}, got {}",
            REPLAY_RATE_MAX,
            args.replay_rate
        );
    }

    let mut engine = PolicyEngine::from_files(&args.rules, &args.signal_number_file)
        .context("failed to load policy configuration")?;

    if let Some(path) = &args.initial_state {
        let presets = load_initial_state(path)
            .with_context(|| format!("failed to load initial state {:?}", path))?;
        for (name, value) in presets {
            engine.preset(&name, value);
        }
    }

    let replay = match &args.replay_log_file {
        Some(path) => vsm_policy::capture::load_replay_log(path)
            .with_context(|| format!("failed to load replay log {:?}", path))?,
        None => Vec::new(),
    };
    // the rate is a property of replay; live runs always track real time
    let rate = if args.replay_log_file.is_some() {
        args.replay_rate
    } else {
        100.0
    };

    let driver = driver::Driver::new(
        engine,
        rate,
        replay,
        args.capture_log.as_deref(),
        args.log_file.as_deref(),
    )?;
    driver.run()
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
