pub mod config;
pub mod corpus;
pub mod frame;
pub mod mutator;
pub mod orchestrator;
pub mod outcome_log;
pub mod transmitter;

pub use config::{CandriftConfig, ConfigError, ReplayConfig};
pub use corpus::{CorpusError, LoadStats, SkipReason, TraceCorpus, TraceFormat};
pub use frame::{Frame, FrameError};
pub use mutator::{DriftMutator, SelectError, apply_drift, select_baseline};
pub use orchestrator::{ReplayError, ReplayOrchestrator, RunState, RunSummary};
pub use outcome_log::{OutcomeLog, OutcomeRecord};
pub use transmitter::{
    CommandTransmitter, FailureKind, FnTransmitter, FrameTransmitter, SendOutcome, Transmit,
    TransmissionStats, TransmitError,
};
