use crate::channel::PacketType;
use bincode::error::{DecodeError, EncodeError};
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the guest runner and the preload shim can report.
///
/// Apart from the executable-symbol warning handled inside the resolver, all
/// of these are fatal: the top-level handler logs them and exits non-zero.
#[derive(Error, Debug)]
pub enum CreteError {
    /// Missing, unparseable or inconsistent run/harness configuration.
    #[error("configuration error{}: {message}", display_file(.file))]
    Configuration {
        file: Option<PathBuf>,
        message: String,
    },

    /// Host and guest disagree on distributed/developer mode.
    #[error("mode conflict ({mode}): {message}")]
    ModeConflict { mode: String, message: String },

    /// A frame of the wrong kind arrived on the configuration channel.
    #[error("network type mismatch: expected {expected:?}, received kind {received}")]
    UnexpectedMessage { expected: PacketType, received: u32 },

    #[error("unable to find or deduce library: {0}")]
    LibraryNotFound(String),

    #[error("ambiguous libraries found for {name}: {first:?} and {second:?}")]
    AmbiguousLibrary {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("failed to read ELF image {path:?}: {message}")]
    Elf { path: PathBuf, message: String },

    /// The environment changed between iterations (e.g. ASLR is enabled).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to host {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

fn display_file(file: &Option<PathBuf>) -> String {
    match file {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl CreteError {
    pub fn configuration(message: impl Into<String>) -> Self {
        CreteError::Configuration {
            file: None,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CreteError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<EncodeError> for CreteError {
    fn from(err: EncodeError) -> Self {
        CreteError::Serialization(format!("Bincode encoding error: {}", err))
    }
}

impl From<DecodeError> for CreteError {
    fn from(err: DecodeError) -> Self {
        CreteError::Serialization(format!("Bincode decoding error: {}", err))
    }
}

impl From<serde_json::Error> for CreteError {
    fn from(err: serde_json::Error) -> Self {
        CreteError::Serialization(format!("JSON operation error: {}", err))
    }
}
