use crate::error::CreteError;
use std::fs;
use std::path::{Path, PathBuf};

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcMapEntry {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub offset: u64,
    /// Backing file, if the mapping is file-backed. Pseudo mappings such as
    /// `[heap]` or `[stack]` have none.
    pub path: Option<PathBuf>,
}

impl ProcMapEntry {
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.as_deref().and_then(Path::file_name)
    }

    pub fn is_executable(&self) -> bool {
        self.permissions.as_bytes().get(2) == Some(&b'x')
    }
}

/// Address-ordered mappings of one process instance.
#[derive(Debug, Clone, Default)]
pub struct ProcessMemoryMap {
    entries: Vec<ProcMapEntry>,
    raw: String,
}

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(match s.split_once(char::is_whitespace) {
        Some((field, rest)) => (field, rest),
        None => (s, ""),
    })
}

fn parse_line(line: &str) -> Result<ProcMapEntry, String> {
    let malformed = || format!("malformed proc map line: {line:?}");

    let (range, rest) = next_field(line).ok_or_else(malformed)?;
    let (permissions, rest) = next_field(rest).ok_or_else(malformed)?;
    let (offset, rest) = next_field(rest).ok_or_else(malformed)?;
    let (_device, rest) = next_field(rest).ok_or_else(malformed)?;
    let (_inode, rest) = next_field(rest).ok_or_else(malformed)?;

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
    let offset = u64::from_str_radix(offset, 16).map_err(|_| malformed())?;

    let name = rest.trim();
    let path = if name.starts_with('/') {
        Some(PathBuf::from(name.trim_end_matches(" (deleted)")))
    } else {
        None
    };

    Ok(ProcMapEntry {
        start,
        end,
        permissions: permissions.to_string(),
        offset,
        path,
    })
}

impl ProcessMemoryMap {
    pub fn parse(text: &str) -> Result<Self, CreteError> {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CreteError::configuration)?;

        Ok(Self {
            entries,
            raw: text.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, CreteError> {
        let text = fs::read_to_string(path).map_err(|e| CreteError::io(path, e))?;
        Self::parse(&text).map_err(|e| match e {
            CreteError::Configuration { message, .. } => CreteError::Configuration {
                file: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    pub fn entries(&self) -> &[ProcMapEntry] {
        &self.entries
    }

    /// All mappings backed by exactly `path`, in address order.
    pub fn find(&self, path: &Path) -> Vec<&ProcMapEntry> {
        self.entries
            .iter()
            .filter(|e| e.path.as_deref() == Some(path))
            .collect()
    }

    /// Distinct backing files in order of first appearance.
    pub fn backing_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        for path in self.entries.iter().filter_map(|e| e.path.as_deref()) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Runtime base of an image: start of its lowest mapping minus that
    /// mapping's file offset.
    pub fn base_address(&self, path: &Path) -> Option<u64> {
        self.find(path)
            .first()
            .map(|e| e.start.saturating_sub(e.offset))
    }

    /// Digest of the captured text; identical layouts hash identically.
    pub fn content_hash(&self) -> [u8; 16] {
        md5::compute(self.raw.as_bytes()).0
    }
}
