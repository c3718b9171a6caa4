//! Fault records and controller errors.

use serde::Serialize;
use std::fmt;

/// Classification of an acquisition failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The source could not be opened.
    SourceUnavailable,
    /// A device stopped delivering data, or a file could not be rewound.
    ReadFailure,
    /// A file reached its end without yielding a single playable frame, so
    /// looping it would spin forever. Ordinary end of file is absorbed by the
    /// looping policy.
    EndOfStream,
    /// Anything the loop did not anticipate, including panics in a source.
    InternalError,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::SourceUnavailable => "source_unavailable",
            FaultKind::ReadFailure => "read_failure",
            FaultKind::EndOfStream => "end_of_stream",
            FaultKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure reported by an acquisition run.
///
/// `sequence` is the sequence number of the last frame published before the
/// fault (0 when none was). Faults never advance the frame sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub sequence: u64,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>, sequence: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            sequence,
        }
    }

    /// Build a fault from an error, keeping the whole context chain.
    pub fn from_error(kind: FaultKind, err: &anyhow::Error, sequence: u64) -> Self {
        Self::new(kind, format!("{:#}", err), sequence)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after frame {}: {}", self.kind, self.sequence, self.message)
    }
}

/// Errors returned synchronously by the controller.
#[derive(Debug)]
pub enum ControlError {
    /// A loop is already starting or running.
    AlreadyRunning,
    /// The acquisition thread could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::AlreadyRunning => f.write_str("acquisition is already running"),
            ControlError::Spawn(err) => write!(f, "failed to spawn acquisition thread: {}", err),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::AlreadyRunning => None,
            ControlError::Spawn(err) => Some(err),
        }
    }
}
