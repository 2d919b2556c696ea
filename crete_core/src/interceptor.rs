//! Startup logic run inside the target process before its entry point.
//!
//! The platform hook (see the `crete_preload` crate) only gathers the
//! process facts into a [`StartupEnvironment`], asks [`should_activate`],
//! calls [`intercept`], and acts on the [`StartupOutcome`]. Everything here
//! is plain Rust and testable without a preloaded process.

use crate::bridge::InstrumentationBridge;
use crate::config::{
    Argument, HARNESS_CONFIG_FILE, HarnessConfiguration, PRIME_ENV, PROC_MAPS_FILE,
    RAMDISK_PATH_ENV, STDIN_RAMDISK_FILE, StdStream, TargetFile, check_argument_indices,
};
use crate::error::CreteError;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub const STDIN_TAG: &str = "crete-stdin";
pub const STDIN_POSIX_TAG: &str = "crete-stdin-posix";
const POSIX_SUFFIX: &str = "-posix";

/// Exit status for a failure to stage symbolic stdin.
pub const STDIN_STAGING_EXIT: i32 = 255;

/// Process facts the interceptor needs, gathered by the platform hook.
#[derive(Debug, Clone)]
pub struct StartupEnvironment {
    /// argv[0] as the target received it.
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub maps_source: PathBuf,
    pub maps_dest: PathBuf,
    /// Directory holding the stdin staging file.
    pub ramdisk: PathBuf,
    /// The runner launched this instance only to capture its memory map.
    pub prime: bool,
    /// Only activate inside the executable named by the persisted
    /// configuration.
    pub verify_executable: bool,
    /// Point descriptor 0 at the staging file.
    pub redirect_stdin: bool,
}

impl StartupEnvironment {
    /// Reads the environment of the current process. Relative paths resolve
    /// against the working directory the runner launched the target in.
    pub fn from_process(program: PathBuf, verify_executable: bool) -> Self {
        let ramdisk = std::env::var_os(RAMDISK_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let prime = std::env::var(PRIME_ENV).is_ok_and(|v| v == "1");

        Self {
            program,
            config_path: PathBuf::from(HARNESS_CONFIG_FILE),
            maps_source: PathBuf::from("/proc/self/maps"),
            maps_dest: PathBuf::from(PROC_MAPS_FILE),
            ramdisk,
            prime,
            verify_executable,
            redirect_stdin: true,
        }
    }

    pub fn stdin_staging_file(&self) -> PathBuf {
        self.ramdisk.join(STDIN_RAMDISK_FILE)
    }
}

#[derive(Debug)]
pub enum StartupOutcome {
    /// Map captured for the prime run; the process should exit 0.
    Primed,
    /// Inputs applied. `argv` holds NUL-terminated arguments and `symbolic`
    /// the file and stdin buffers handed to the bridge. Both must stay
    /// alive for the rest of the process.
    Applied {
        argv: Vec<Box<[u8]>>,
        symbolic: Vec<Box<[u8]>>,
    },
}

/// Whether this process is the configured target. Without executable
/// verification every process that loads the hook is.
pub fn should_activate(env: &StartupEnvironment) -> Result<bool, CreteError> {
    if !env.verify_executable || executable_matches(env)? {
        return Ok(true);
    }
    debug!("{:?} is not the configured target, declining", env.program);
    Ok(false)
}

/// Captures the memory map, then (unless this is the prime run) applies the
/// persisted harness configuration.
pub fn intercept<B: InstrumentationBridge>(
    env: &StartupEnvironment,
    argv: Vec<Vec<u8>>,
    bridge: &mut B,
) -> Result<StartupOutcome, CreteError> {
    capture_memory_map(&env.maps_source, &env.maps_dest)?;
    if env.prime {
        info!("Prime run: memory map captured to {:?}", env.maps_dest);
        return Ok(StartupOutcome::Primed);
    }

    let config = HarnessConfiguration::read_from(&env.config_path)?;
    debug!(
        "Applying harness configuration (first iteration: {})",
        config.is_first_iteration
    );

    // Order matters: argv first, then files, then stdin.
    let argv = rewrite_argv(argv, &config.arguments, bridge)?;
    let mut symbolic = Vec::new();
    for file in config.files.iter().filter(|f| f.concolic) {
        symbolic.extend(inject_file(file, bridge)?);
    }
    symbolic.extend(inject_stdin(&config.stdin, env, bridge)?);

    Ok(StartupOutcome::Applied { argv, symbolic })
}

/// Process exit status for an interceptor failure.
pub fn exit_code(err: &CreteError) -> i32 {
    match err {
        CreteError::Io { path, .. }
            if path.file_name() == Some(OsStr::new(STDIN_RAMDISK_FILE)) =>
        {
            STDIN_STAGING_EXIT
        }
        _ => 1,
    }
}

fn executable_matches(env: &StartupEnvironment) -> Result<bool, CreteError> {
    if !env.config_path.exists() {
        return Ok(false);
    }
    let config = HarnessConfiguration::read_from(&env.config_path)?;
    let configured = fs::canonicalize(&config.executable);
    let running = fs::canonicalize(&env.program);
    Ok(match (configured, running) {
        (Ok(configured), Ok(running)) => configured == running,
        _ => false,
    })
}

pub fn capture_memory_map(source: &Path, dest: &Path) -> Result<(), CreteError> {
    let maps = fs::read(source).map_err(|e| CreteError::io(source, e))?;
    fs::write(dest, maps).map_err(|e| CreteError::io(dest, e))
}

fn nul_terminated(bytes: &[u8]) -> Box<[u8]> {
    let mut owned = Vec::with_capacity(bytes.len() + 1);
    owned.extend_from_slice(bytes);
    owned.push(0);
    owned.into_boxed_slice()
}

/// Places every configured argument at its index, growing argv with empty
/// strings as needed. argv[0] is never touched. Concolic values get their
/// own buffer marked symbolic as `argv_<index>`.
pub fn rewrite_argv<B: InstrumentationBridge>(
    argv: Vec<Vec<u8>>,
    arguments: &[Argument],
    bridge: &mut B,
) -> Result<Vec<Box<[u8]>>, CreteError> {
    check_argument_indices(arguments, None)?;

    let slots = arguments
        .iter()
        .map(|a| a.index + 1)
        .max()
        .unwrap_or(0)
        .max(argv.len());

    let mut rewritten: Vec<Box<[u8]>> = argv.iter().map(|a| nul_terminated(a)).collect();
    rewritten.resize_with(slots, || nul_terminated(b""));

    for arg in arguments {
        let mut buffer = nul_terminated(arg.value.as_bytes());
        if arg.concolic {
            let len = buffer.len() - 1;
            bridge.mark_symbolic(&mut buffer[..len], &format!("argv_{}", arg.index))?;
        }
        rewritten[arg.index] = buffer;
    }

    Ok(rewritten)
}

fn tag_posix(name: &str) -> String {
    format!("{name}{POSIX_SUFFIX}")
}

fn zeroed(size: u64) -> Result<Box<[u8]>, CreteError> {
    let len = usize::try_from(size)
        .map_err(|_| CreteError::configuration(format!("buffer size {size} is too large")))?;
    Ok(vec![0u8; len].into_boxed_slice())
}

/// Realises a concolic file: a symbolic zero buffer written to the file's
/// path, plus a second zero buffer for descriptor-level reads. Returns both
/// buffers; the caller keeps them alive.
pub fn inject_file<B: InstrumentationBridge>(
    file: &TargetFile,
    bridge: &mut B,
) -> Result<[Box<[u8]>; 2], CreteError> {
    let name = match file.file_name() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(CreteError::configuration(format!(
                "concolic file {:?} has no file name",
                file.path
            )));
        }
    };
    if file.size == 0 {
        return Err(CreteError::configuration(format!(
            "concolic file {:?} must have a size greater than zero",
            file.path
        )));
    }

    let mut buffer = zeroed(file.size)?;
    bridge.mark_symbolic(&mut buffer, name)?;
    fs::write(&file.path, &buffer).map_err(|e| CreteError::io(&file.path, e))?;

    let mut posix = zeroed(file.size)?;
    bridge.mark_symbolic(&mut posix, &tag_posix(name))?;

    debug!("Made {:?} concolic ({} bytes)", file.path, file.size);
    Ok([buffer, posix])
}

/// Stages a symbolic stdin and a second buffer for descriptor-level reads.
/// Returns the buffers marked, none when stdin is not concolic.
pub fn inject_stdin<B: InstrumentationBridge>(
    stdin: &StdStream,
    env: &StartupEnvironment,
    bridge: &mut B,
) -> Result<Vec<Box<[u8]>>, CreteError> {
    if !stdin.concolic || stdin.size == 0 {
        return Ok(Vec::new());
    }

    let staging = env.stdin_staging_file();
    let mut buffer = zeroed(stdin.size)?;
    bridge.mark_symbolic(&mut buffer, STDIN_TAG)?;

    let mut out = File::create(&staging).map_err(|e| CreteError::io(&staging, e))?;
    out.write_all(&buffer)
        .map_err(|e| CreteError::io(&staging, e))?;
    drop(out);

    if env.redirect_stdin {
        redirect_stdin(&staging)?;
    } else {
        warn!("stdin redirection disabled, staging file {:?} left unused", staging);
    }

    let mut posix = zeroed(stdin.size)?;
    bridge.mark_symbolic(&mut posix, STDIN_POSIX_TAG)?;
    Ok(vec![buffer, posix])
}

fn redirect_stdin(staging: &Path) -> Result<(), CreteError> {
    let file = File::open(staging).map_err(|e| CreteError::io(staging, e))?;
    // SAFETY: both descriptors are valid; dup2 atomically replaces fd 0 and
    // `file` closing its own descriptor afterwards leaves fd 0 intact.
    if unsafe { libc::dup2(file.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
        return Err(CreteError::io(staging, std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeEvent, RecordingBridge};
    use tempfile::{TempDir, tempdir};

    fn environment(dir: &TempDir) -> StartupEnvironment {
        let maps_source = dir.path().join("maps.in");
        fs::write(&maps_source, "00400000-00401000 r-xp 00000000 08:02 1 /bin/prog\n").unwrap();
        StartupEnvironment {
            program: PathBuf::from("/bin/prog"),
            config_path: dir.path().join(HARNESS_CONFIG_FILE),
            maps_source,
            maps_dest: dir.path().join(PROC_MAPS_FILE),
            ramdisk: dir.path().to_path_buf(),
            prime: false,
            verify_executable: false,
            redirect_stdin: false,
        }
    }

    fn harness(executable: &Path) -> HarnessConfiguration {
        HarnessConfiguration {
            executable: executable.to_path_buf(),
            stdin: StdStream::default(),
            files: Vec::new(),
            arguments: Vec::new(),
            is_first_iteration: true,
        }
    }

    fn argument(index: usize, value: &str, concolic: bool) -> Argument {
        Argument {
            index,
            value: value.to_string(),
            concolic,
        }
    }

    fn strings(argv: &[Box<[u8]>]) -> Vec<String> {
        argv.iter()
            .map(|a| {
                assert_eq!(a.last(), Some(&0));
                String::from_utf8(a[..a.len() - 1].to_vec()).unwrap()
            })
            .collect()
    }

    fn owned_regions(buffers: &[Box<[u8]>]) -> Vec<(usize, usize)> {
        buffers
            .iter()
            .map(|b| (b.as_ptr() as usize, b.len()))
            .collect()
    }

    #[test]
    fn argv_grows_with_an_unpopulated_slot() {
        let mut bridge = RecordingBridge::default();
        let argv = rewrite_argv(
            vec![b"prog".to_vec()],
            &[argument(2, "-x", false)],
            &mut bridge,
        )
        .unwrap();
        assert_eq!(strings(&argv), vec!["prog", "", "-x"]);
        assert!(bridge.events.is_empty());
    }

    #[test]
    fn argv_rejects_duplicate_and_reserved_indices() {
        let mut bridge = RecordingBridge::default();
        let duplicate = [argument(1, "a", false), argument(1, "b", false)];
        assert!(rewrite_argv(vec![b"prog".to_vec()], &duplicate, &mut bridge).is_err());
        let reserved = [argument(0, "evil", false)];
        assert!(rewrite_argv(vec![b"prog".to_vec()], &reserved, &mut bridge).is_err());
    }

    #[test]
    fn concolic_argument_is_marked_by_index() {
        let mut bridge = RecordingBridge::default();
        let argv = rewrite_argv(
            vec![b"prog".to_vec(), b"old".to_vec()],
            &[argument(1, "seed", true)],
            &mut bridge,
        )
        .unwrap();
        assert_eq!(strings(&argv), vec!["prog", "seed"]);
        match &bridge.events[..] {
            [BridgeEvent::MarkSymbolic { tag, address, contents }] => {
                assert_eq!(tag, "argv_1");
                assert_eq!(contents, b"seed");
                assert_eq!(*address, argv[1].as_ptr() as usize);
            }
            other => panic!("Unexpected bridge events {other:?}"),
        }
    }

    #[test]
    fn concolic_file_is_written_and_tagged_twice() {
        let dir = tempdir().unwrap();
        let file = TargetFile {
            path: dir.path().join("input.bin"),
            size: 64,
            concolic: true,
            data: Vec::new(),
        };
        let mut bridge = RecordingBridge::default();
        let buffers = inject_file(&file, &mut bridge).unwrap();
        assert_eq!(bridge.symbolic_regions(), owned_regions(&buffers));

        assert_eq!(fs::read(&file.path).unwrap(), vec![0u8; 64]);
        assert_eq!(bridge.symbolic_tags(), vec!["input.bin", "input.bin-posix"]);
        for event in &bridge.events {
            match event {
                BridgeEvent::MarkSymbolic { contents, .. } => assert_eq!(contents, &vec![0u8; 64]),
                other => panic!("Unexpected bridge event {other:?}"),
            }
        }
    }

    #[test]
    fn unwritable_concolic_file_is_fatal() {
        let dir = tempdir().unwrap();
        let file = TargetFile {
            path: dir.path().join("missing-dir").join("input.bin"),
            size: 8,
            concolic: true,
            data: Vec::new(),
        };
        let mut bridge = RecordingBridge::default();
        let err = inject_file(&file, &mut bridge).unwrap_err();
        assert!(matches!(err, CreteError::Io { .. }), "{err:?}");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn concolic_stdin_uses_two_buffers() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let stdin = StdStream {
            concolic: true,
            size: 128,
        };
        let mut bridge = RecordingBridge::default();
        let buffers = inject_stdin(&stdin, &env, &mut bridge).unwrap();

        assert_eq!(fs::read(env.stdin_staging_file()).unwrap(), vec![0u8; 128]);
        assert_eq!(bridge.symbolic_tags(), vec![STDIN_TAG, STDIN_POSIX_TAG]);
        for event in &bridge.events {
            match event {
                BridgeEvent::MarkSymbolic { contents, .. } => {
                    assert_eq!(contents, &vec![0u8; 128])
                }
                other => panic!("Unexpected bridge event {other:?}"),
            }
        }
        assert_eq!(bridge.symbolic_regions(), owned_regions(&buffers));
    }

    #[test]
    fn plain_stdin_marks_nothing() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let mut bridge = RecordingBridge::default();
        let buffers = inject_stdin(&StdStream::default(), &env, &mut bridge).unwrap();
        assert!(buffers.is_empty());
        assert!(bridge.events.is_empty());
        assert!(!env.stdin_staging_file().exists());
    }

    #[test]
    fn stdin_staging_failure_maps_to_its_own_exit_status() {
        let dir = tempdir().unwrap();
        let mut env = environment(&dir);
        env.ramdisk = dir.path().join("no-such-ramdisk");
        let stdin = StdStream {
            concolic: true,
            size: 4,
        };
        let err = inject_stdin(&stdin, &env, &mut RecordingBridge::default()).unwrap_err();
        assert_eq!(exit_code(&err), STDIN_STAGING_EXIT);
    }

    #[test]
    fn full_startup_applies_argv_then_files_then_stdin() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let mut config = harness(Path::new("/bin/prog"));
        config.arguments = vec![argument(1, "input.bin", true)];
        config.files = vec![
            TargetFile {
                path: dir.path().join("input.bin"),
                size: 16,
                concolic: true,
                data: Vec::new(),
            },
            TargetFile {
                path: dir.path().join("seed.txt"),
                size: 0,
                concolic: false,
                data: Vec::new(),
            },
        ];
        config.stdin = StdStream {
            concolic: true,
            size: 8,
        };
        config.write_to(&env.config_path).unwrap();

        let mut bridge = RecordingBridge::default();
        let outcome = intercept(&env, vec![b"/bin/prog".to_vec()], &mut bridge).unwrap();
        let (argv, symbolic) = match outcome {
            StartupOutcome::Applied { argv, symbolic } => (argv, symbolic),
            other => panic!("Expected Applied, got {other:?}"),
        };
        assert_eq!(strings(&argv), vec!["/bin/prog", "input.bin"]);
        assert_eq!(symbolic.len(), 4);
        // The argv_1 mark excludes the NUL terminator.
        let mut owned = vec![(argv[1].as_ptr() as usize, argv[1].len() - 1)];
        owned.extend(owned_regions(&symbolic));
        assert_eq!(bridge.symbolic_regions(), owned);
        assert_eq!(
            bridge.symbolic_tags(),
            vec![
                "argv_1",
                "input.bin",
                "input.bin-posix",
                STDIN_TAG,
                STDIN_POSIX_TAG
            ]
        );
        assert!(!dir.path().join("seed.txt").exists());
        assert_eq!(
            fs::read_to_string(&env.maps_dest).unwrap(),
            fs::read_to_string(&env.maps_source).unwrap()
        );
    }

    #[test]
    fn prime_run_only_captures_the_map() {
        let dir = tempdir().unwrap();
        let mut env = environment(&dir);
        env.prime = true;

        let mut bridge = RecordingBridge::default();
        let outcome = intercept(&env, vec![b"/bin/prog".to_vec()], &mut bridge).unwrap();
        assert!(matches!(outcome, StartupOutcome::Primed));
        assert!(env.maps_dest.exists());
        assert!(bridge.events.is_empty());
    }

    #[test]
    fn missing_harness_configuration_is_fatal() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let err = intercept(&env, vec![b"/bin/prog".to_vec()], &mut RecordingBridge::default())
            .unwrap_err();
        assert!(matches!(err, CreteError::Io { .. }), "{err:?}");
    }

    #[test]
    fn host_check_declines_inside_other_executables() {
        let dir = tempdir().unwrap();
        let mut env = environment(&dir);
        env.program = PathBuf::from("/bin/sh");
        assert!(should_activate(&env).unwrap());

        env.verify_executable = true;
        assert!(!should_activate(&env).unwrap());

        harness(Path::new("/definitely/not/sh"))
            .write_to(&env.config_path)
            .unwrap();
        assert!(!should_activate(&env).unwrap());
    }

    #[test]
    fn host_check_activates_inside_the_configured_executable() {
        let dir = tempdir().unwrap();
        let mut env = environment(&dir);
        env.verify_executable = true;
        env.program = std::env::current_exe().unwrap();
        harness(&env.program).write_to(&env.config_path).unwrap();

        assert!(should_activate(&env).unwrap());
        let outcome = intercept(&env, vec![b"self".to_vec()], &mut RecordingBridge::default()).unwrap();
        assert!(matches!(outcome, StartupOutcome::Applied { .. }));
    }
}
