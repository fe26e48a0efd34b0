use crate::corpus::TraceCorpus;
use crate::frame::{Frame, PAYLOAD_CAPACITY};
use rand::Rng;
use rand::seq::index;
use thiserror::Error;
use tracing::debug;

/// Defines a probability that a baseline is drifted, if not overridden.
pub const DEFAULT_DRIFT_PROBABILITY: f64 = 0.7;
/// Defines the default largest absolute change applied to a drifted byte.
pub const DEFAULT_MAX_DRIFT: u8 = 2;

/// Raised when a baseline cannot be drawn for an identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("Identifier {0} has no observations in the corpus")]
    IdentifierNotFound(String),
}

/// Picks one observed frame for `identifier` uniformly at random.
pub fn select_baseline<'c, R: Rng + ?Sized>(
    corpus: &'c TraceCorpus,
    identifier: &str,
    rng: &mut R,
) -> Result<&'c Frame, SelectError> {
    let count = corpus.count_for(identifier);
    if count == 0 {
        return Err(SelectError::IdentifierNotFound(identifier.to_string()));
    }
    let n = rng.random_range(0..count);
    corpus
        .nth_for(identifier, n)
        .ok_or_else(|| SelectError::IdentifierNotFound(identifier.to_string()))
}

/// Derives a candidate frame from `baseline`.
///
/// With probability `probability` the candidate gets 1 or 2 distinct payload positions
/// nudged by a delta drawn from `[-max_delta, max_delta]`, saturating at 0 and 255.
/// Otherwise the candidate is an unmodified copy. Identifier and length are never touched,
/// and the baseline itself is left as is.
pub fn apply_drift<R: Rng + ?Sized>(
    baseline: &Frame,
    probability: f64,
    max_delta: u8,
    rng: &mut R,
) -> Frame {
    let mut candidate = baseline.clone();

    // One draw decides whether this frame is drifted at all.
    let draw: f64 = rng.random();
    if draw >= probability {
        return candidate;
    }

    let positions_to_drift = rng.random_range(1..=2);
    let max_delta = i16::from(max_delta);
    let payload = candidate.payload_mut();
    for pos in index::sample(&mut *rng, PAYLOAD_CAPACITY, positions_to_drift) {
        let original = payload[pos];
        let delta = rng.random_range(-max_delta..=max_delta);
        let drifted = (i16::from(original) + delta).clamp(0, 255) as u8;
        payload[pos] = drifted;
        debug!(
            "Drift @ byte {}: 0x{:02X} -> 0x{:02X} ({:+})",
            pos, original, drifted, delta
        );
    }
    candidate
}

/// The evasion policy: small, sparse payload drift with a fixed per-frame probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftMutator {
    probability: f64,
    max_delta: u8,
}

impl DriftMutator {
    pub fn new(probability: f64, max_delta: u8) -> Self {
        Self {
            probability,
            max_delta,
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn max_delta(&self) -> u8 {
        self.max_delta
    }

    pub fn mutate<R: Rng + ?Sized>(&self, baseline: &Frame, rng: &mut R) -> Frame {
        apply_drift(baseline, self.probability, self.max_delta, rng)
    }
}

impl Default for DriftMutator {
    fn default() -> Self {
        Self::new(DEFAULT_DRIFT_PROBABILITY, DEFAULT_MAX_DRIFT)
    }
}
