use crate::frame::Frame;
use crate::transmitter::SendOutcome;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One line of the outcome log.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutcomeRecord<'a> {
    pub seq: u64,
    pub id: &'a str,
    pub dlc: u8,
    pub data: String,
    pub wire: &'a str,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl<'a> OutcomeRecord<'a> {
    pub fn new(frame: &'a Frame, outcome: &'a SendOutcome, elapsed: Duration) -> Self {
        Self {
            seq: outcome.sequence,
            id: frame.identifier(),
            dlc: frame.length(),
            data: frame.payload_hex(),
            wire: &outcome.wire,
            ok: outcome.is_success(),
            error: outcome.error.as_ref().map(|e| e.to_string()),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Append-only JSON-lines record of every transmitted frame.
///
/// The file is opened in append mode and each record is flushed as soon as its line ends,
/// so an interrupted run leaves every completed line on disk.
#[derive(Debug)]
pub struct OutcomeLog {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl OutcomeLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: LineWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &OutcomeRecord<'_>) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")
    }
}
