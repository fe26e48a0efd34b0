use crate::corpus::{DEFAULT_MAX_FRAMES_PER_ID, TraceCorpus};
use crate::frame::normalize_identifier;
use crate::mutator::{DEFAULT_DRIFT_PROBABILITY, DEFAULT_MAX_DRIFT};
use crate::transmitter::DEFAULT_TRANSMIT_TIMEOUT;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Identifiers targeted when no explicit list is configured.
pub const DEFAULT_TARGET_IDS: [&str; 24] = [
    "0018", "0034", "0153", "0370", "0440", "02B0", "0164", "0165", "018F", "01F1", "0220",
    "0260", "02A0", "02C0", "0316", "0329", "0350", "0382", "043F", "04B0", "04F0", "04F1",
    "04F2", "0545",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("message-rate must be a finite number above zero, got {0}")]
    InvalidRate(f64),
    #[error("duration must be at least one second")]
    InvalidDuration,
    #[error("duration of {0} s is too long to schedule")]
    DurationTooLong(u64),
    #[error("drift-probability must be within [0, 1], got {0}")]
    InvalidProbability(f64),
    #[error("target-ids must not be empty")]
    NoTargets,
    #[error("target identifier is invalid: {0}")]
    InvalidTarget(String),
    #[error("interface name must not be empty")]
    EmptyInterface,
    #[error(
        "none of the target identifiers [{}] occur in the corpus; \
         set use-all-observed-ids-if-missing to replay every observed identifier instead",
        .0.join(", ")
    )]
    TargetsNotInCorpus(Vec<String>),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    #[serde(default = "default_target_ids")]
    pub target_ids: Vec<String>,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_message_rate")]
    pub message_rate: f64,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_drift_probability")]
    pub drift_probability: f64,
    #[serde(default = "default_max_drift")]
    pub max_drift: u8,
    #[serde(default)]
    pub use_all_observed_ids_if_missing: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

pub fn default_target_ids() -> Vec<String> {
    DEFAULT_TARGET_IDS.iter().map(|id| id.to_string()).collect()
}
pub fn default_interface() -> String {
    "can0".to_string()
}
pub fn default_message_rate() -> f64 {
    9.5
}
pub fn default_duration_secs() -> u64 {
    30 * 60
}
fn default_drift_probability() -> f64 {
    DEFAULT_DRIFT_PROBABILITY
}
fn default_max_drift() -> u8 {
    DEFAULT_MAX_DRIFT
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            target_ids: default_target_ids(),
            interface: default_interface(),
            message_rate: default_message_rate(),
            duration_secs: default_duration_secs(),
            drift_probability: default_drift_probability(),
            max_drift: default_max_drift(),
            use_all_observed_ids_if_missing: false,
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    #[serde(default = "default_max_frames_per_id")]
    pub max_frames_per_id: usize,
}

fn default_max_frames_per_id() -> usize {
    DEFAULT_MAX_FRAMES_PER_ID
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            trace_path: None,
            max_frames_per_id: default_max_frames_per_id(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransmitSettings {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_command() -> Vec<String> {
    vec!["cansend".to_string()]
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TRANSMIT_TIMEOUT.as_millis() as u64
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default)]
    pub outcome_log: Option<PathBuf>,
}

/// The whole file configuration, every section optional.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CandriftConfig {
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub transmit: TransmitSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl CandriftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CandriftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit.timeout_ms)
    }

    /// Validates the replay section into an immutable [`ReplayConfig`].
    pub fn replay_config(&self) -> Result<ReplayConfig, ConfigError> {
        let replay = &self.replay;
        if !replay.message_rate.is_finite() || replay.message_rate <= 0.0 {
            return Err(ConfigError::InvalidRate(replay.message_rate));
        }
        if replay.duration_secs == 0 {
            return Err(ConfigError::InvalidDuration);
        }
        if !(0.0..=1.0).contains(&replay.drift_probability) {
            return Err(ConfigError::InvalidProbability(replay.drift_probability));
        }
        if replay.interface.trim().is_empty() {
            return Err(ConfigError::EmptyInterface);
        }
        if replay.target_ids.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let target_ids = replay
            .target_ids
            .iter()
            .map(|id| {
                normalize_identifier(id).map_err(|e| ConfigError::InvalidTarget(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = ReplayConfig {
            target_ids,
            interface: replay.interface.trim().to_string(),
            message_rate: replay.message_rate,
            duration: Duration::from_secs(replay.duration_secs),
            drift_probability: replay.drift_probability,
            max_drift: replay.max_drift,
            use_all_observed_ids_if_missing: replay.use_all_observed_ids_if_missing,
            seed: replay.seed,
        };
        config.send_interval()?;
        config.deadline_from(Instant::now())?;
        Ok(config)
    }
}

/// Everything the orchestrator needs for one run. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    pub target_ids: Vec<String>,
    pub interface: String,
    pub message_rate: f64,
    pub duration: Duration,
    pub drift_probability: f64,
    pub max_drift: u8,
    pub use_all_observed_ids_if_missing: bool,
    pub seed: Option<u64>,
}

impl ReplayConfig {
    /// Time between two scheduled sends.
    pub fn send_interval(&self) -> Result<Duration, ConfigError> {
        if !self.message_rate.is_finite() || self.message_rate <= 0.0 {
            return Err(ConfigError::InvalidRate(self.message_rate));
        }
        Duration::try_from_secs_f64(1.0 / self.message_rate)
            .map_err(|_| ConfigError::InvalidRate(self.message_rate))
    }

    /// End of a run started at `start`.
    pub fn deadline_from(&self, start: Instant) -> Result<Instant, ConfigError> {
        start
            .checked_add(self.duration)
            .ok_or(ConfigError::DurationTooLong(self.duration.as_secs()))
    }

    /// Checks the configured targets against `corpus` and returns the config to run with.
    ///
    /// Targets missing from the corpus are reported. If at least one target is present, the
    /// list is kept as configured and missing ones are skipped at run time. If none is
    /// present, the run either switches to every observed identifier (when
    /// `use_all_observed_ids_if_missing` is set) or fails.
    pub fn resolve_targets(self, corpus: &TraceCorpus) -> Result<ReplayConfig, ConfigError> {
        let missing: Vec<String> = self
            .target_ids
            .iter()
            .filter(|id| !corpus.contains(id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(self);
        }

        warn!(
            "Target identifiers absent from the corpus: {}",
            missing.join(", ")
        );
        let available = corpus.identifiers();
        info!("Identifiers present in the corpus ({}):", available.len());
        for id in &available {
            info!("  ID 0x{}: {} frames", id, corpus.count_for(id));
        }

        if missing.len() < self.target_ids.len() {
            return Ok(self);
        }
        if !self.use_all_observed_ids_if_missing || available.is_empty() {
            return Err(ConfigError::TargetsNotInCorpus(missing));
        }

        info!(
            "Falling back to all {} observed identifiers",
            available.len()
        );
        Ok(ReplayConfig {
            target_ids: available.into_iter().map(str::to_string).collect(),
            ..self
        })
    }
}
