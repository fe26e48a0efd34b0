use crate::frame::{Frame, FrameError, PAYLOAD_CAPACITY, identifier_value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Default number of frames retained per identifier when scanning a line trace.
pub const DEFAULT_MAX_FRAMES_PER_ID: usize = 50;

/// How often (in lines) load progress is reported while scanning a line trace.
const PROGRESS_LINE_INTERVAL: u64 = 100_000;

/// Number of freshly parsed frames dumped at debug level to help eyeball the format.
const DEBUG_DUMP_FRAMES: u64 = 3;

/// Number of identifiers whose bucket sizes are listed in the load summary.
const SUMMARY_ID_SAMPLE: usize = 5;

/// Minimum number of whitespace tokens a line needs to be considered a frame record.
const MIN_RECORD_TOKENS: usize = 6;

/// Defines errors that abort loading a trace corpus.
///
/// Individual malformed trace lines are not errors; they are counted in [`LoadStats`]
/// and described by [`SkipReason`].
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The source has no recognizable extension, or its shape cannot be interpreted
    /// (e.g. a tabular file without the mandatory `ID`/`LEN` columns).
    #[error("Unsupported trace format: {0}")]
    Format(String),

    /// An I/O error occurred while opening or reading the source.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A tabular row could not be turned into a frame.
    #[error("Tabular row {row}: {message}")]
    Tabular { row: u64, message: String },
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<csv::Error> for CorpusError {
    fn from(err: csv::Error) -> Self {
        match err.position() {
            Some(pos) => CorpusError::Tabular {
                row: pos.line(),
                message: err.to_string(),
            },
            None => CorpusError::Io(format!("CSV read error: {err}")),
        }
    }
}

/// The on-disk shapes a corpus can be loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    /// Whitespace-tokenized trace (`.trc`, `.log`, `.asc`) with an `Rx`/`Tx` marker per record.
    LineTrace,
    /// Curated table (`.csv`) with `ID`, `LEN` and `D1`..`D8` columns.
    Tabular,
}

impl TraceFormat {
    /// Picks the format from the file extension, case-insensitively.
    pub fn detect(path: &Path) -> Result<Self, CorpusError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("trc") | Some("log") | Some("asc") => Ok(TraceFormat::LineTrace),
            Some("csv") => Ok(TraceFormat::Tabular),
            Some(other) => Err(CorpusError::Format(format!(
                "{path:?} has extension '.{other}', expected .trc, .log, .asc or .csv"
            ))),
            None => Err(CorpusError::Format(format!(
                "{path:?} has no extension, expected .trc, .log, .asc or .csv"
            ))),
        }
    }
}

/// Why a line of a line trace was not turned into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Fewer than six tokens, or the marker is too close to the end of the line.
    TooFewTokens,
    /// No `Rx`/`Tx` token on the line.
    NoDirection,
    /// The identifier token is not hexadecimal.
    BadIdentifier,
    /// The length token is not an integer in 0..=8.
    BadLength,
    /// A data token inside the declared length is not a hex byte.
    BadByte,
    /// The line ran out of data tokens before the declared length.
    InsufficientData,
    /// The identifier already reached its retention cap.
    CapReached,
}

/// Counters accumulated while loading a corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Lines (or rows) read from the source, including comments and blanks.
    pub lines: u64,
    /// Frames retained in the corpus.
    pub parsed: u64,
    /// Record lines rejected as malformed.
    pub skipped: u64,
    /// Well-placed records dropped because their identifier hit the retention cap.
    pub discarded: u64,
}

/// An immutable, identifier-indexed collection of observed frames.
///
/// Every frame lives once in `frames`; `by_id` maps each identifier to the indices of
/// its frames in observation order, so each frame belongs to exactly one bucket.
#[derive(Debug, Clone, Default)]
pub struct TraceCorpus {
    frames: Vec<Frame>,
    by_id: HashMap<String, Vec<usize>>,
    stats: LoadStats,
}

impl TraceCorpus {
    /// Loads a corpus from `path`, choosing the parser by extension.
    ///
    /// `max_frames_per_id` caps each identifier's bucket for line traces; tabular files
    /// are taken as already curated and are not capped. An empty result is not an error
    /// here; callers check [`TraceCorpus::is_empty`] before starting a run.
    pub fn load(path: &Path, max_frames_per_id: usize) -> Result<Self, CorpusError> {
        let format = TraceFormat::detect(path)?;
        info!("Loading trace corpus from {:?} ({:?})", path, format);
        let file = File::open(path)
            .map_err(|e| CorpusError::Io(format!("Failed to open trace {path:?}: {e}")))?;
        let corpus = match format {
            TraceFormat::LineTrace => {
                Self::from_trace_reader(BufReader::new(file), max_frames_per_id)?
            }
            TraceFormat::Tabular => Self::from_tabular_reader(file)?,
        };
        corpus.log_summary();
        Ok(corpus)
    }

    /// Scans a line trace. Malformed lines are counted and skipped, never fatal.
    pub fn from_trace_reader<R: BufRead>(
        mut reader: R,
        max_frames_per_id: usize,
    ) -> Result<Self, CorpusError> {
        let mut corpus = TraceCorpus::default();
        let mut raw_line = Vec::new();

        loop {
            raw_line.clear();
            if reader.read_until(b'\n', &mut raw_line)? == 0 {
                break;
            }
            corpus.stats.lines += 1;
            if corpus.stats.lines % PROGRESS_LINE_INTERVAL == 0 {
                info!(
                    "Read {} lines | kept {} | skipped {} | discarded {}",
                    corpus.stats.lines,
                    corpus.stats.parsed,
                    corpus.stats.skipped,
                    corpus.stats.discarded
                );
            }

            // Traces are not guaranteed to be UTF-8; undecodable bytes never matter
            // for the hex fields we read.
            let line = String::from_utf8_lossy(&raw_line);
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with("//") {
                continue;
            }

            let cap_check = |id: &str| corpus.count_for(id) >= max_frames_per_id;
            match parse_trace_line(line, cap_check) {
                Ok(frame) => {
                    corpus.push(frame);
                    if corpus.stats.parsed <= DEBUG_DUMP_FRAMES {
                        debug!("Parsed {}", corpus.frames[corpus.frames.len() - 1]);
                    }
                }
                Err(SkipReason::CapReached) => corpus.stats.discarded += 1,
                Err(reason) => {
                    corpus.stats.skipped += 1;
                    debug!("Line {} skipped: {:?}", corpus.stats.lines, reason);
                }
            }
        }

        info!(
            "Line trace parsed: {} frames kept from {} lines ({} skipped, {} discarded by cap)",
            corpus.stats.parsed, corpus.stats.lines, corpus.stats.skipped, corpus.stats.discarded
        );
        Ok(corpus)
    }

    /// Reads a tabular corpus. Every data row yields exactly one frame; missing or empty
    /// `D1`..`D8` cells default to zero.
    pub fn from_tabular_reader<R: Read>(reader: R) -> Result<Self, CorpusError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
        };
        let id_col = column("ID")
            .ok_or_else(|| CorpusError::Format("Tabular header has no 'ID' column".into()))?;
        let len_col = column("LEN")
            .ok_or_else(|| CorpusError::Format("Tabular header has no 'LEN' column".into()))?;
        let byte_cols: Vec<Option<usize>> = (1..=PAYLOAD_CAPACITY)
            .map(|i| column(&format!("D{i}")))
            .collect();

        let mut corpus = TraceCorpus::default();
        for record in csv_reader.records() {
            let record = record?;
            let row = record.position().map_or(corpus.stats.lines + 2, |p| p.line());
            corpus.stats.lines += 1;
            let row_error = |message: String| CorpusError::Tabular { row, message };

            let identifier = record.get(id_col).unwrap_or_default();
            let length_field = record.get(len_col).unwrap_or_default();
            let length: u8 = length_field
                .parse()
                .map_err(|_| row_error(format!("LEN '{length_field}' is not an integer")))?;

            let mut bytes = [0u8; PAYLOAD_CAPACITY];
            for (slot, col) in bytes.iter_mut().zip(&byte_cols) {
                let cell = col.and_then(|c| record.get(c)).unwrap_or_default();
                if cell.is_empty() {
                    continue;
                }
                *slot = u8::from_str_radix(cell, 16)
                    .map_err(|_| row_error(format!("'{cell}' is not a hex byte")))?;
            }

            let frame = Frame::new(identifier, length, &bytes)
                .map_err(|e: FrameError| row_error(e.to_string()))?;
            corpus.push(frame);
        }

        info!("Tabular corpus parsed: {} frames", corpus.stats.parsed);
        Ok(corpus)
    }

    fn push(&mut self, frame: Frame) {
        let index = self.frames.len();
        self.by_id
            .entry(frame.identifier().to_string())
            .or_default()
            .push(index);
        self.frames.push(frame);
        self.stats.parsed += 1;
    }

    /// All frames in observation order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frames observed for `identifier`, in observation order. Empty when unknown.
    pub fn frames_for(&self, identifier: &str) -> Vec<&Frame> {
        self.by_id
            .get(identifier)
            .map(|indices| indices.iter().map(|&i| &self.frames[i]).collect())
            .unwrap_or_default()
    }

    /// The `n`-th frame observed for `identifier`.
    pub fn nth_for(&self, identifier: &str, n: usize) -> Option<&Frame> {
        self.by_id
            .get(identifier)
            .and_then(|indices| indices.get(n))
            .map(|&i| &self.frames[i])
    }

    pub fn count_for(&self, identifier: &str) -> usize {
        self.by_id.get(identifier).map_or(0, Vec::len)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.by_id.contains_key(identifier)
    }

    /// Distinct identifiers, ordered by numeric value (ties broken by spelling).
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_id.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| (identifier_value(id), *id));
        ids
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    /// Logs totals, the identifier list, and bucket sizes for the first few identifiers.
    pub fn log_summary(&self) {
        info!("Corpus holds {} frames", self.frames.len());
        info!("Distinct identifiers: {}", self.by_id.len());
        let ids = self.identifiers();
        if ids.is_empty() {
            return;
        }
        info!("Identifiers: {}", ids.join(", "));
        for id in ids.iter().take(SUMMARY_ID_SAMPLE) {
            info!("  ID {}: {} frames", id, self.count_for(id));
        }
    }
}

/// Parses one non-comment trace line into a frame.
///
/// The record layout is `... Rx|Tx <id> <len> <byte> <byte> ...`; anything before the
/// direction marker (sequence number, timestamp) is ignored. Up to eight hex tokens after
/// the length are collected, stopping at the first token that is not a hex byte. The
/// record is kept when at least `len` bytes were collected; surplus bytes are stored but
/// not transmitted.
///
/// `at_cap` is consulted with the normalized identifier before the rest of the record is
/// parsed, so capped identifiers are dropped regardless of what follows.
pub fn parse_trace_line(
    line: &str,
    at_cap: impl Fn(&str) -> bool,
) -> Result<Frame, SkipReason> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < MIN_RECORD_TOKENS {
        return Err(SkipReason::TooFewTokens);
    }

    let marker = tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case("RX") || t.eq_ignore_ascii_case("TX"))
        .ok_or(SkipReason::NoDirection)?;
    if marker + 2 >= tokens.len() {
        return Err(SkipReason::TooFewTokens);
    }

    let identifier = tokens[marker + 1].to_ascii_uppercase();
    if at_cap(&identifier) {
        return Err(SkipReason::CapReached);
    }

    let length: u8 = tokens[marker + 2]
        .parse()
        .map_err(|_| SkipReason::BadLength)?;
    if length as usize > PAYLOAD_CAPACITY {
        return Err(SkipReason::BadLength);
    }

    let mut bytes = Vec::with_capacity(PAYLOAD_CAPACITY);
    let mut hit_bad_token = false;
    for token in tokens.iter().skip(marker + 3).take(PAYLOAD_CAPACITY) {
        match u8::from_str_radix(token, 16) {
            Ok(b) => bytes.push(b),
            Err(_) => {
                hit_bad_token = true;
                break;
            }
        }
    }
    if bytes.len() < length as usize {
        return Err(if hit_bad_token {
            SkipReason::BadByte
        } else {
            SkipReason::InsufficientData
        });
    }

    Frame::new(&identifier, length, &bytes).map_err(|_| SkipReason::BadIdentifier)
}
