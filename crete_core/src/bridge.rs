use crate::error::CreteError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const BRIDGE_JOURNAL_ENV: &str = "CRETE_BRIDGE_JOURNAL";
pub const PORT_FILE_ENV: &str = "CRETE_PORT_FILE";
pub const DEFAULT_BRIDGE_JOURNAL: &str = "crete-bridge.journal";
pub const DEFAULT_PORT_FILE: &str = "crete-port";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    Include,
    Exclude,
    CallStackExclude,
}

/// A half-open address range `[start, end)` handed to the execution engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressFilter {
    pub start: u64,
    pub end: u64,
    pub kind: FilterKind,
}

impl AddressFilter {
    pub fn new(start: u64, end: u64, kind: FilterKind) -> Self {
        Self { start, end, kind }
    }

    /// Zero-width filter registered when a symbol cannot be located.
    pub fn empty(kind: FilterKind) -> Self {
        Self::new(0, 0, kind)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Capability exposed by the instrumented execution engine.
///
/// The runner and the preload shim only ever talk to the engine through
/// this trait; how a call reaches the engine (custom instructions, a
/// journal, a test double) is up to the implementation.
pub trait InstrumentationBridge {
    /// Port the host listens on, or 0 while it is not yet known.
    fn read_port(&mut self) -> Result<u16, CreteError>;

    /// Marks `buffer` as symbolic under `tag`. The engine may later rewrite
    /// the bytes in place, so the buffer must outlive the target's use of it.
    fn mark_symbolic(&mut self, buffer: &mut [u8], tag: &str) -> Result<(), CreteError>;

    fn add_filter(&mut self, filter: &AddressFilter) -> Result<(), CreteError>;

    fn signal_prime(&mut self) -> Result<(), CreteError>;

    fn signal_dump(&mut self) -> Result<(), CreteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// `address` is where the marked buffer lived at the time of the call.
    MarkSymbolic {
        tag: String,
        address: usize,
        contents: Vec<u8>,
    },
    Filter(AddressFilter),
    Prime,
    Dump,
}

/// Keeps every bridge call in memory.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    pub port: u16,
    pub events: Vec<BridgeEvent>,
}

impl RecordingBridge {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            events: Vec::new(),
        }
    }

    pub fn filters(&self) -> Vec<AddressFilter> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Filter(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    pub fn symbolic_tags(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::MarkSymbolic { tag, .. } => Some(tag.as_str()),
                _ => None,
            })
            .collect()
    }

    /// `(address, len)` of every buffer marked symbolic, in call order.
    pub fn symbolic_regions(&self) -> Vec<(usize, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::MarkSymbolic {
                    address, contents, ..
                } => Some((*address, contents.len())),
                _ => None,
            })
            .collect()
    }
}

impl InstrumentationBridge for RecordingBridge {
    fn read_port(&mut self) -> Result<u16, CreteError> {
        Ok(self.port)
    }

    fn mark_symbolic(&mut self, buffer: &mut [u8], tag: &str) -> Result<(), CreteError> {
        self.events.push(BridgeEvent::MarkSymbolic {
            tag: tag.to_string(),
            address: buffer.as_ptr() as usize,
            contents: buffer.to_vec(),
        });
        Ok(())
    }

    fn add_filter(&mut self, filter: &AddressFilter) -> Result<(), CreteError> {
        self.events.push(BridgeEvent::Filter(*filter));
        Ok(())
    }

    fn signal_prime(&mut self) -> Result<(), CreteError> {
        self.events.push(BridgeEvent::Prime);
        Ok(())
    }

    fn signal_dump(&mut self) -> Result<(), CreteError> {
        self.events.push(BridgeEvent::Dump);
        Ok(())
    }
}

/// One line of the bridge journal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JournalEntry {
    MarkSymbolic {
        pid: u32,
        tag: String,
        address: u64,
        len: u64,
    },
    AddFilter {
        pid: u32,
        filter: AddressFilter,
    },
    Prime {
        pid: u32,
    },
    Dump {
        pid: u32,
    },
}

/// Bridge for running outside the instrumented VM: each call is appended as
/// a JSON line to a journal file, and the host port is read from a file
/// written by whoever starts the host side.
#[derive(Debug)]
pub struct JournalBridge {
    journal_path: PathBuf,
    journal: File,
    port_file: PathBuf,
}

impl JournalBridge {
    pub fn open(journal_path: &Path, port_file: &Path) -> Result<Self, CreteError> {
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path)
            .map_err(|e| CreteError::io(journal_path, e))?;
        Ok(Self {
            journal_path: journal_path.to_path_buf(),
            journal,
            port_file: port_file.to_path_buf(),
        })
    }

    /// Opens the journal named by `CRETE_BRIDGE_JOURNAL` and polls the port
    /// file named by `CRETE_PORT_FILE`, falling back to the defaults.
    pub fn from_env() -> Result<Self, CreteError> {
        let journal = std::env::var_os(BRIDGE_JOURNAL_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BRIDGE_JOURNAL));
        let port_file = std::env::var_os(PORT_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PORT_FILE));
        Self::open(&journal, &port_file)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), CreteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.journal
            .write_all(&line)
            .map_err(|e| CreteError::io(&self.journal_path, e))
    }

    pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, CreteError> {
        let text = fs::read_to_string(path).map_err(|e| CreteError::io(path, e))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(CreteError::from))
            .collect()
    }
}

impl InstrumentationBridge for JournalBridge {
    fn read_port(&mut self) -> Result<u16, CreteError> {
        // Absent or half-written port files read as "not yet".
        Ok(fs::read_to_string(&self.port_file)
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(0))
    }

    fn mark_symbolic(&mut self, buffer: &mut [u8], tag: &str) -> Result<(), CreteError> {
        self.append(&JournalEntry::MarkSymbolic {
            pid: std::process::id(),
            tag: tag.to_string(),
            address: buffer.as_ptr() as u64,
            len: buffer.len() as u64,
        })
    }

    fn add_filter(&mut self, filter: &AddressFilter) -> Result<(), CreteError> {
        self.append(&JournalEntry::AddFilter {
            pid: std::process::id(),
            filter: *filter,
        })
    }

    fn signal_prime(&mut self) -> Result<(), CreteError> {
        self.append(&JournalEntry::Prime {
            pid: std::process::id(),
        })
    }

    fn signal_dump(&mut self) -> Result<(), CreteError> {
        self.append(&JournalEntry::Dump {
            pid: std::process::id(),
        })
    }
}
