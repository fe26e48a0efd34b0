use candrift_core::config::CandriftConfig;
use candrift_core::corpus::TraceCorpus;
use candrift_core::orchestrator::{ReplayError, ReplayOrchestrator};
use candrift_core::outcome_log::OutcomeLog;
use candrift_core::transmitter::CommandTransmitter;

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "candrift.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Replays drifted CAN traffic sampled from a recorded trace", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to ./candrift.toml when present)
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Trace to sample baselines from (.trc, .log, .asc or .csv)
    #[clap(short, long)]
    trace: Option<PathBuf>,
    /// CAN interface to transmit on
    #[clap(short, long)]
    interface: Option<String>,
    /// Messages per second
    #[clap(short, long)]
    rate: Option<f64>,
    /// Run duration in seconds
    #[clap(short, long)]
    duration: Option<u64>,
    /// Comma-separated target identifiers, e.g. 0018,01F1
    #[clap(long, value_delimiter = ',')]
    targets: Option<Vec<String>>,
    #[clap(long)]
    drift_probability: Option<f64>,
    #[clap(long)]
    max_drift: Option<u8>,
    /// Replay every observed identifier when none of the targets occur in the trace
    #[clap(long)]
    use_all_observed_ids: bool,
    /// Seed for reproducible target, baseline and drift choices
    #[clap(long)]
    seed: Option<u64>,
    /// Append a JSON line per transmitted frame to this file
    #[clap(long)]
    outcome_log: Option<PathBuf>,
    /// Also write the diagnostic log to this file (default: candrift_<unix-time>.log)
    #[clap(long, conflicts_with = "no_log_file")]
    log_file: Option<PathBuf>,
    /// Log to stderr only
    #[clap(long)]
    no_log_file: bool,
    #[clap(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut CandriftConfig) {
        if let Some(trace) = &self.trace {
            config.corpus.trace_path = Some(trace.clone());
        }
        let replay = &mut config.replay;
        if let Some(interface) = &self.interface {
            replay.interface = interface.clone();
        }
        if let Some(rate) = self.rate {
            replay.message_rate = rate;
        }
        if let Some(duration) = self.duration {
            replay.duration_secs = duration;
        }
        if let Some(targets) = &self.targets {
            replay.target_ids = targets.clone();
        }
        if let Some(probability) = self.drift_probability {
            replay.drift_probability = probability;
        }
        if let Some(max_drift) = self.max_drift {
            replay.max_drift = max_drift;
        }
        if self.use_all_observed_ids {
            replay.use_all_observed_ids_if_missing = true;
        }
        if let Some(seed) = self.seed {
            replay.seed = Some(seed);
        }
        if let Some(path) = &self.outcome_log {
            config.output.outcome_log = Some(path.clone());
        }
    }

    fn log_file_path(&self) -> Option<PathBuf> {
        if self.no_log_file {
            return None;
        }
        self.log_file.clone().or_else(|| {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Some(PathBuf::from(format!("candrift_{stamp}.log")))
        })
    }
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path:?}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<CandriftConfig, anyhow::Error> {
    match &cli.config {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            CandriftConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                CandriftConfig::load_from_file(&default_config_path)
            } else {
                info!(
                    "No config file specified and default '{DEFAULT_CONFIG_PATH}' not found, using built-in defaults."
                );
                Ok(CandriftConfig::default())
            }
        }
    }
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let mut config = load_config(&cli)?;
    cli.apply_overrides(&mut config);

    let trace_path = config
        .corpus
        .trace_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No trace given: pass --trace or set corpus.trace-path"))?;

    let corpus = TraceCorpus::load(&trace_path, config.corpus.max_frames_per_id)
        .with_context(|| format!("Failed to load trace {trace_path:?}"))?;
    if corpus.is_empty() {
        error!("No frames found in {trace_path:?}; check that the trace format is correct");
        return Err(ReplayError::EmptyCorpus.into());
    }

    let replay_config = config.replay_config()?.resolve_targets(&corpus)?;

    let primitive = CommandTransmitter::new(
        config.transmit.command.clone(),
        config.transmit_timeout(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("Failed to install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("Failed to install SIGTERM handler")?;

    let mut orchestrator =
        ReplayOrchestrator::new(replay_config, &corpus, primitive).with_stop_flag(stop);
    if let Some(path) = &config.output.outcome_log {
        let log = OutcomeLog::open(path)
            .with_context(|| format!("Failed to open outcome log {path:?}"))?;
        orchestrator = orchestrator.with_outcome_log(log);
    }

    let summary = orchestrator.run()?;
    if summary.sent > 0 && summary.succeeded == 0 {
        error!("No frame was accepted by the bus; see the errors above");
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let log_file = cli.log_file_path();
    init_logging(cli.verbose, log_file.as_ref())?;
    if let Some(path) = &log_file {
        info!("Writing log to {path:?}");
    }
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::parse_from([
            "candrift",
            "--trace",
            "dataset200.trc",
            "--interface",
            "vcan1",
            "--rate",
            "20",
            "--duration",
            "3",
            "--targets",
            "0018,01f1",
            "--max-drift",
            "4",
            "--use-all-observed-ids",
            "--seed",
            "9",
            "--no-log-file",
        ]);
        let mut config = CandriftConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.corpus.trace_path, Some(PathBuf::from("dataset200.trc")));
        let replay = config.replay_config().unwrap();
        assert_eq!(replay.interface, "vcan1");
        assert_eq!(replay.message_rate, 20.0);
        assert_eq!(replay.duration.as_secs(), 3);
        assert_eq!(replay.target_ids, vec!["0018", "01F1"]);
        assert_eq!(replay.max_drift, 4);
        assert_eq!(replay.drift_probability, 0.7);
        assert!(replay.use_all_observed_ids_if_missing);
        assert_eq!(replay.seed, Some(9));
        assert_eq!(cli.log_file_path(), None);
    }

    #[test]
    fn log_file_defaults_to_timestamped_name() {
        let cli = Cli::parse_from(["candrift"]);
        let path = cli.log_file_path().unwrap();
        let name = path.to_string_lossy();
        assert!(name.starts_with("candrift_") && name.ends_with(".log"));

        let cli = Cli::parse_from(["candrift", "--log-file", "run.log"]);
        assert_eq!(cli.log_file_path(), Some(PathBuf::from("run.log")));
    }

    #[test]
    fn log_file_flags_conflict() {
        let result = Cli::try_parse_from(["candrift", "--log-file", "a.log", "--no-log-file"]);
        assert!(result.is_err());
    }
}
