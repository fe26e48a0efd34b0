use crate::config::ReplayConfig;
use crate::corpus::TraceCorpus;
use crate::mutator::{DriftMutator, SelectError, select_baseline};
use crate::outcome_log::{OutcomeLog, OutcomeRecord};
use crate::transmitter::{FrameTransmitter, Transmit, TransmissionStats};
use rand::SeedableRng;
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Progress is logged every this many successfully delivered frames.
const PROGRESS_EVERY_SUCCESSES: u64 = 100;

/// Longest single sleep while pacing, so a stop request is noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

const BANNER: &str = "============================================================";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("Trace corpus is empty, refusing to start a replay run")]
    EmptyCorpus,
    #[error("Invalid replay configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("Replay run cannot start from state {0:?}")]
    InvalidState(RunState),
}

/// Lifecycle of a [`ReplayOrchestrator`]: it runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Final figures of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Iterations dropped because the chosen identifier had no observations.
    pub skipped: u64,
    pub interrupted: bool,
}

impl RunSummary {
    fn new(elapsed: Duration, stats: &TransmissionStats, skipped: u64, interrupted: bool) -> Self {
        Self {
            elapsed,
            sent: stats.sent(),
            succeeded: stats.succeeded(),
            failed: stats.failed(),
            skipped,
            interrupted,
        }
    }

    /// `succeeded / sent`, 0 when nothing was sent.
    pub fn success_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.sent as f64
        }
    }

    /// Frames per second actually achieved over the whole run.
    pub fn average_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sent as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{BANNER}")?;
        if self.interrupted {
            writeln!(f, "REPLAY STOPPED (interrupted)")?;
        } else {
            writeln!(f, "REPLAY FINISHED")?;
        }
        writeln!(f, "Elapsed:      {:.1} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Sent:         {} frames", self.sent)?;
        writeln!(
            f,
            "Succeeded:    {} ({:.1}%)",
            self.succeeded,
            self.success_rate() * 100.0
        )?;
        writeln!(f, "Failed:       {}", self.failed)?;
        writeln!(f, "Skipped:      {}", self.skipped)?;
        writeln!(f, "Average rate: {:.2} msg/s", self.average_rate())?;
        write!(f, "{BANNER}")
    }
}

/// Drives one replay run: pick a target, draw a baseline, drift it, send it, pace.
///
/// Sends are scheduled on a fixed grid (`start + n / rate`). The run ends when
/// the configured duration has elapsed or the stop flag is raised; either way the summary
/// is logged exactly once and returned.
pub struct ReplayOrchestrator<'c, T: Transmit> {
    config: ReplayConfig,
    corpus: &'c TraceCorpus,
    mutator: DriftMutator,
    transmitter: FrameTransmitter<T>,
    rng: ChaCha8Rng,
    state: RunState,
    stop: Arc<AtomicBool>,
    outcome_log: Option<OutcomeLog>,
    reported_missing: HashSet<String>,
    skipped: u64,
}

impl<'c, T: Transmit> ReplayOrchestrator<'c, T> {
    pub fn new(config: ReplayConfig, corpus: &'c TraceCorpus, primitive: T) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            mutator: DriftMutator::new(config.drift_probability, config.max_drift),
            config,
            corpus,
            transmitter: FrameTransmitter::new(primitive),
            rng,
            state: RunState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            outcome_log: None,
            reported_missing: HashSet::new(),
            skipped: 0,
        }
    }

    /// Uses `stop` as the interruption signal instead of the orchestrator's own flag.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_outcome_log(mut self, log: OutcomeLog) -> Self {
        self.outcome_log = Some(log);
        self
    }

    /// A handle that ends the run when set to `true`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> &TransmissionStats {
        self.transmitter.stats()
    }

    pub fn transmitter(&self) -> &FrameTransmitter<T> {
        &self.transmitter
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Runs the replay to completion or interruption.
    pub fn run(&mut self) -> Result<RunSummary, ReplayError> {
        if self.state != RunState::Idle {
            return Err(ReplayError::InvalidState(self.state));
        }
        if self.corpus.is_empty() {
            return Err(ReplayError::EmptyCorpus);
        }
        if self.config.target_ids.is_empty() {
            return Err(crate::config::ConfigError::NoTargets.into());
        }
        let interval = self.config.send_interval()?;
        let start = Instant::now();
        let deadline = self.config.deadline_from(start)?;

        self.state = RunState::Running;
        info!("{BANNER}");
        info!("REPLAY STARTED");
        info!("Targets:  {}", self.config.target_ids.join(", "));
        info!("Interface: {}", self.config.interface);
        info!("Rate:     {} msg/s", self.config.message_rate);
        info!("Duration: {} s", self.config.duration.as_secs_f64());
        info!(
            "Drift:    p={} max=±{}",
            self.mutator.probability(),
            self.mutator.max_delta()
        );
        info!("{BANNER}");

        let mut next_send = start;
        let mut delivered: u64 = 0;

        while !self.stop_requested() && start.elapsed() < self.config.duration {
            let Some(target) = self.config.target_ids.choose(&mut self.rng).cloned() else {
                break;
            };

            let baseline = match select_baseline(self.corpus, &target, &mut self.rng) {
                Ok(frame) => frame,
                Err(SelectError::IdentifierNotFound(id)) => {
                    self.skipped += 1;
                    if self.reported_missing.insert(id.clone()) {
                        warn!("ID {} has no observations in the corpus, skipping it", id);
                    }
                    if self
                        .config
                        .target_ids
                        .iter()
                        .all(|t| self.reported_missing.contains(t))
                    {
                        warn!("No target ID has observations in the corpus, ending replay");
                        break;
                    }
                    continue;
                }
            };

            let candidate = self.mutator.mutate(baseline, &mut self.rng);
            let outcome = self
                .transmitter
                .transmit(&candidate, &self.config.interface);

            if let Some(log) = self.outcome_log.as_mut() {
                let record = OutcomeRecord::new(&candidate, &outcome, start.elapsed());
                if let Err(e) = log.append(&record) {
                    warn!("Failed to append to outcome log {:?}: {}", log.path(), e);
                }
            }

            if outcome.is_success() {
                delivered += 1;
                if delivered % PROGRESS_EVERY_SUCCESSES == 0 {
                    let stats = self.transmitter.stats();
                    info!(
                        "Progress: {} delivered | {:.1} s | success {:.1}%",
                        delivered,
                        start.elapsed().as_secs_f64(),
                        stats.success_rate() * 100.0
                    );
                }
            }

            next_send = next_send
                .checked_add(interval)
                .map_or(deadline, |next| next.min(deadline));
            self.sleep_until(next_send);
        }

        let interrupted = self.stop_requested();
        if interrupted {
            info!("Stop requested, ending replay");
        }
        self.state = RunState::Stopped;

        let summary = RunSummary::new(
            start.elapsed(),
            self.transmitter.stats(),
            self.skipped,
            interrupted,
        );
        for line in summary.to_string().lines() {
            info!("{}", line);
        }
        if let Some(log) = &self.outcome_log {
            info!("Outcome log: {:?}", log.path());
        }
        Ok(summary)
    }

    fn sleep_until(&self, wake_at: Instant) {
        loop {
            if self.stop_requested() {
                return;
            }
            let now = Instant::now();
            if now >= wake_at {
                return;
            }
            std::thread::sleep((wake_at - now).min(MAX_SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::transmitter::TransmitError;
    use crate::transmitter::test_utils::RecordingTransmitter;
    use std::io::Cursor;
    use std::thread;

    const TRACE: &str = "\
1) 1.0 Rx 0018 2 10 20
2) 2.0 Rx 0018 2 10 21
3) 3.0 Rx 0370 8 00 52 EF 00 0F EC D0 0E
4) 4.0 Rx 01F1 4 DE AD BE EF
";

    fn corpus() -> TraceCorpus {
        TraceCorpus::from_trace_reader(Cursor::new(TRACE), 50).unwrap()
    }

    fn config(targets: &[&str], rate: f64, duration: Duration) -> ReplayConfig {
        ReplayConfig {
            target_ids: targets.iter().map(|t| t.to_string()).collect(),
            interface: "vcan0".to_string(),
            message_rate: rate,
            duration,
            drift_probability: 0.7,
            max_drift: 2,
            use_all_observed_ids_if_missing: false,
            seed: Some(1234),
        }
    }

    #[test]
    fn run_sends_paced_frames_and_summarizes() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018", "0370", "01F1"], 10.0, Duration::from_secs(2)),
            &corpus,
            RecordingTransmitter::default(),
        );
        assert_eq!(orchestrator.state(), RunState::Idle);

        let summary = orchestrator.run().unwrap();
        assert_eq!(orchestrator.state(), RunState::Stopped);
        assert!(
            (18..=21).contains(&summary.sent),
            "sent {} frames",
            summary.sent
        );
        assert!(
            (summary.average_rate() - 10.0).abs() < 1.5,
            "average rate {}",
            summary.average_rate()
        );
        assert_eq!(summary.sent, summary.succeeded + summary.failed);
        assert_eq!(summary.succeeded, summary.sent);
        assert_eq!(summary.success_rate(), 1.0);
        assert!(!summary.interrupted);

        let calls = &orchestrator.transmitter().primitive().calls;
        assert_eq!(calls.len() as u64, summary.sent);
        for (iface, wire) in calls {
            assert_eq!(iface, "vcan0");
            assert!(
                wire.starts_with("018#") || wire.starts_with("370#") || wire.starts_with("1F1#"),
                "unexpected wire frame {wire}"
            );
        }
    }

    #[test]
    fn drifted_frames_keep_identifier_and_length() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0370"], 200.0, Duration::from_millis(300)),
            &corpus,
            RecordingTransmitter::default(),
        );
        orchestrator.run().unwrap();
        let calls = &orchestrator.transmitter().primitive().calls;
        assert!(!calls.is_empty());
        for (_, wire) in calls {
            assert!(wire.starts_with("370#"));
            assert_eq!(wire.len(), "370#".len() + 16);
        }
    }

    #[test]
    fn missing_identifier_is_skipped_without_sending() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0999"], 50.0, Duration::from_millis(100)),
            &corpus,
            RecordingTransmitter::default(),
        );
        let summary = orchestrator.run().unwrap();
        assert_eq!(summary.sent, 0);
        assert!(summary.skipped > 0);
        assert_eq!(summary.success_rate(), 0.0);
        assert_eq!(orchestrator.stats().sent(), 0);
        assert!(orchestrator.transmitter().primitive().calls.is_empty());
    }

    #[test]
    fn failures_are_counted_and_the_run_continues() {
        let corpus = corpus();
        let script = vec![
            Err(TransmitError::InterfaceUnavailable("vcan0".into())),
            Err(TransmitError::InterfaceUnavailable("vcan0".into())),
            Err(TransmitError::Rejected("bus busy".into())),
        ];
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 100.0, Duration::from_millis(200)),
            &corpus,
            RecordingTransmitter::with_script(script),
        );
        let summary = orchestrator.run().unwrap();
        assert!(summary.sent > 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.succeeded, summary.sent - 3);
    }

    #[test]
    fn empty_corpus_refuses_to_start() {
        let corpus = TraceCorpus::default();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 10.0, Duration::from_secs(1)),
            &corpus,
            RecordingTransmitter::default(),
        );
        assert_eq!(orchestrator.run(), Err(ReplayError::EmptyCorpus));
        assert_eq!(orchestrator.state(), RunState::Idle);
    }

    #[test]
    fn invalid_config_refuses_to_start() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&[], 10.0, Duration::from_secs(1)),
            &corpus,
            RecordingTransmitter::default(),
        );
        assert_eq!(
            orchestrator.run(),
            Err(ReplayError::Config(ConfigError::NoTargets))
        );
    }

    #[test]
    fn unschedulable_rate_or_duration_is_an_error() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 1e-20, Duration::from_secs(1)),
            &corpus,
            RecordingTransmitter::default(),
        );
        assert_eq!(
            orchestrator.run(),
            Err(ReplayError::Config(ConfigError::InvalidRate(1e-20)))
        );
        assert_eq!(orchestrator.state(), RunState::Idle);

        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 10.0, Duration::MAX),
            &corpus,
            RecordingTransmitter::default(),
        );
        assert_eq!(
            orchestrator.run(),
            Err(ReplayError::Config(ConfigError::DurationTooLong(u64::MAX)))
        );
        assert!(orchestrator.transmitter().primitive().calls.is_empty());
    }

    #[test]
    fn slow_rate_ends_at_the_deadline() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 1e-15, Duration::from_millis(100)),
            &corpus,
            RecordingTransmitter::default(),
        );
        let summary = orchestrator.run().unwrap();
        assert_eq!(summary.sent, 1);
        assert!(summary.elapsed < Duration::from_secs(2));
    }

    #[test]
    fn a_run_happens_only_once() {
        let corpus = corpus();
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018"], 100.0, Duration::from_millis(50)),
            &corpus,
            RecordingTransmitter::default(),
        );
        orchestrator.run().unwrap();
        assert_eq!(
            orchestrator.run(),
            Err(ReplayError::InvalidState(RunState::Stopped))
        );
    }

    #[test]
    fn stop_flag_interrupts_and_still_summarizes() {
        let corpus = corpus();
        let stop = Arc::new(AtomicBool::new(false));
        let mut orchestrator = ReplayOrchestrator::new(
            config(&["0018", "01F1"], 20.0, Duration::from_secs(60)),
            &corpus,
            RecordingTransmitter::default(),
        )
        .with_stop_flag(Arc::clone(&stop));

        let stopper = {
            let stop = orchestrator.stop_handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                stop.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        let summary = orchestrator.run().unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.interrupted);
        assert!(summary.sent >= 1);
        assert_eq!(summary.sent, summary.succeeded + summary.failed);
        assert_eq!(orchestrator.state(), RunState::Stopped);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn seeded_runs_choose_the_same_frames() {
        let corpus = corpus();
        let run = || {
            let mut orchestrator = ReplayOrchestrator::new(
                config(&["0018", "0370", "01F1"], 500.0, Duration::from_millis(40)),
                &corpus,
                RecordingTransmitter::default(),
            );
            orchestrator.run().unwrap();
            orchestrator.transmitter().primitive().calls.clone()
        };
        let first = run();
        let second = run();
        let common = first.len().min(second.len());
        assert!(common > 0);
        assert_eq!(first[..common], second[..common]);
    }

    #[test]
    fn summary_display_and_rates() {
        let summary = RunSummary {
            elapsed: Duration::from_secs(4),
            sent: 40,
            succeeded: 30,
            failed: 10,
            skipped: 2,
            interrupted: false,
        };
        assert_eq!(summary.success_rate(), 0.75);
        assert_eq!(summary.average_rate(), 10.0);
        let text = summary.to_string();
        assert!(text.contains("REPLAY FINISHED"));
        assert!(text.contains("Sent:         40 frames"));
        assert!(text.contains("Succeeded:    30 (75.0%)"));
        assert!(text.contains("Average rate: 10.00 msg/s"));

        let empty = RunSummary {
            elapsed: Duration::ZERO,
            sent: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            interrupted: true,
        };
        assert_eq!(empty.success_rate(), 0.0);
        assert_eq!(empty.average_rate(), 0.0);
        assert!(empty.to_string().contains("interrupted"));
    }
}
