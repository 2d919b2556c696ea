use crate::error::CreteError;
use bincode::{Decode, Encode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Per-process configuration blob, written next to the target before launch.
pub const HARNESS_CONFIG_FILE: &str = "harness.config.serialized";
/// Process memory map captured by the preload shim on every launch.
pub const PROC_MAPS_FILE: &str = "proc-maps.log";
/// Accumulated runner log, truncated when a campaign starts.
pub const RUN_LOG_FILE: &str = "run.log";
/// Default startup-hook library injected through `LD_PRELOAD`.
pub const DEFAULT_PRELOAD_LIBRARY: &str = "libcrete_run_preload.so";
/// Name of the staging file that backs a symbolic stdin.
pub const STDIN_RAMDISK_FILE: &str = "crete_stdin_ramdisk";

pub const RAMDISK_PATH_ENV: &str = "CRETE_RAMDISK_PATH";
pub const PRIME_ENV: &str = "CRETE_PRIME";

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StdStream {
    #[serde(default)]
    pub concolic: bool,
    #[serde(default)]
    pub size: u64,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetFile {
    pub path: PathBuf,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub concolic: bool,
    /// Concrete contents shipped to the host with the first configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl TargetFile {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Argument {
    pub index: usize,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub concolic: bool,
}

/// A function to include in or exclude from instrumentation. An empty or
/// missing `lib` designates the executable itself.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FunctionTarget {
    #[serde(default)]
    pub lib: Option<String>,
    pub name: String,
}

impl FunctionTarget {
    pub fn library(&self) -> Option<&str> {
        self.lib.as_deref().filter(|lib| !lib.is_empty())
    }
}

fn default_first_iteration() -> bool {
    true
}

/// Orchestrator-owned description of the target and how to instrument it.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunConfiguration {
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(default)]
    pub stdin: StdStream,
    #[serde(default)]
    pub files: Vec<TargetFile>,
    #[serde(default)]
    pub libraries: BTreeSet<String>,
    #[serde(default)]
    pub include_functions: Vec<FunctionTarget>,
    #[serde(default)]
    pub exclude_functions: Vec<FunctionTarget>,
    #[serde(default)]
    pub section_exclusions: BTreeSet<String>,
    #[serde(default = "default_first_iteration")]
    pub is_first_iteration: bool,
}

impl RunConfiguration {
    pub fn load_from_file(path: &Path) -> Result<Self, CreteError> {
        let content = fs::read_to_string(path).map_err(|e| CreteError::Configuration {
            file: Some(path.to_path_buf()),
            message: format!("Failed to read config file: {}", e),
        })?;

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            CreteError::Configuration { message, .. } => CreteError::Configuration {
                file: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CreteError> {
        let config: RunConfiguration = toml::from_str(content)
            .map_err(|e| CreteError::configuration(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CreteError> {
        if self.executable.as_os_str().is_empty() {
            return Err(CreteError::configuration("executable path is empty"));
        }

        check_argument_indices(&self.arguments, Some(self.arguments.len() + 1))?;

        for file in self.files.iter().filter(|f| f.concolic) {
            if file.file_name().is_none_or(str::is_empty) {
                return Err(CreteError::configuration(format!(
                    "concolic file {:?} has no file name",
                    file.path
                )));
            }
            if file.size == 0 {
                return Err(CreteError::configuration(format!(
                    "concolic file {:?} must have a size greater than zero",
                    file.path
                )));
            }
        }

        Ok(())
    }

    /// Builds the initial argv: slot 0 is the executable, every declared
    /// argument lands at its index, undeclared slots stay empty.
    pub fn launch_args(&self) -> Result<Vec<String>, CreteError> {
        // +1 for argv[0]
        let slot_count = self.arguments.len() + 1;
        check_argument_indices(&self.arguments, Some(slot_count))?;

        let mut args = vec![String::new(); slot_count];
        args[0] = self.executable.to_string_lossy().into_owned();
        for arg in &self.arguments {
            args[arg.index] = arg.value.clone();
        }
        Ok(args)
    }

    /// Parent directory of the executable if writable, otherwise the current
    /// working directory.
    pub fn launch_directory(&self) -> Result<PathBuf, CreteError> {
        let parent = match self.executable.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        if is_writable(&parent) {
            return Ok(parent);
        }

        debug!(
            "Launch directory {:?} is not writable, falling back to the working directory",
            parent
        );
        std::env::current_dir().map_err(|e| CreteError::io(".", e))
    }

    /// Reads the contents of every non-concolic file so the host receives
    /// them with the guest configuration. Returns how many were loaded.
    pub fn load_file_data(&mut self, launch_dir: &Path) -> Result<usize, CreteError> {
        let mut loaded = 0;
        for file in self.files.iter_mut().filter(|f| !f.concolic) {
            let full_path = launch_dir.join(&file.path);
            if !full_path.is_file() {
                warn!("Input file {:?} does not exist, nothing to embed", full_path);
                continue;
            }
            file.data = fs::read(&full_path).map_err(|e| CreteError::io(&full_path, e))?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn clear_file_data(&mut self) {
        for file in &mut self.files {
            file.data = Vec::new();
        }
    }

    pub fn harness(&self) -> HarnessConfiguration {
        HarnessConfiguration {
            executable: self.executable.clone(),
            stdin: self.stdin.clone(),
            files: self
                .files
                .iter()
                .map(|f| TargetFile {
                    data: Vec::new(),
                    ..f.clone()
                })
                .collect(),
            arguments: self.arguments.clone(),
            is_first_iteration: self.is_first_iteration,
        }
    }
}

/// Argument indices must be unique, non-zero (argv[0] is reserved) and, when
/// `limit` is given, below it.
pub fn check_argument_indices(
    arguments: &[Argument],
    limit: Option<usize>,
) -> Result<(), CreteError> {
    let mut seen = HashSet::new();
    for arg in arguments {
        if arg.index == 0 {
            return Err(CreteError::configuration(
                "argument index 0 is reserved for the executable path",
            ));
        }
        if let Some(limit) = limit {
            if arg.index >= limit {
                return Err(CreteError::configuration(format!(
                    "argument index {} is out of range (must be below {})",
                    arg.index, limit
                )));
            }
        }
        if !seen.insert(arg.index) {
            return Err(CreteError::configuration(format!(
                "duplicate argument index {}",
                arg.index
            )));
        }
    }
    Ok(())
}

fn is_writable(dir: &Path) -> bool {
    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `c_path` is a valid NUL-terminated string for the call's duration.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// The minimal per-process view of a [`RunConfiguration`] that the preload
/// shim consumes once at target startup.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfiguration {
    pub executable: PathBuf,
    pub stdin: StdStream,
    pub files: Vec<TargetFile>,
    pub arguments: Vec<Argument>,
    pub is_first_iteration: bool,
}

impl HarnessConfiguration {
    pub fn write_to(&self, path: &Path) -> Result<(), CreteError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;
        fs::write(path, bytes).map_err(|e| CreteError::io(path, e))
    }

    pub fn read_from(path: &Path) -> Result<Self, CreteError> {
        let bytes = fs::read(path).map_err(|e| CreteError::io(path, e))?;
        if bytes.is_empty() {
            return Err(CreteError::Configuration {
                file: Some(path.to_path_buf()),
                message: "harness configuration is empty".to_string(),
            });
        }
        let (config, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(config)
    }
}
